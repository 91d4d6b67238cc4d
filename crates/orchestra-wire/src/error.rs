//! Error types for the wire and state layers.

use thiserror::Error;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Encoding failed: {0}")]
    Codec(String),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("No encoder registered for classifier '{0}'")]
    UnknownClassifier(String),
}

/// Alias for transport results.
pub type WireResult<T> = Result<T, WireError>;

/// Errors from the replicated state layer.
#[derive(Debug, Error)]
pub enum StateError {
    /// The connection backing this state replica is gone.
    #[error("Connection closed")]
    ConnectionClosed,
    /// The state coordinator task has stopped (the owning peer was closed).
    #[error("State engine stopped")]
    EngineStopped,
    #[error("Failed to encode state value: {0}")]
    Encode(String),
    #[error("Failed to decode state value: {0}")]
    Decode(String),
    /// Every compare-and-set attempt was rejected.
    #[error("Update rejected {attempts} times under contention")]
    ContentionExhausted { attempts: u32 },
}

/// Alias for state results.
pub type StateResult<T> = Result<T, StateError>;
