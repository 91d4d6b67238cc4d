//! Core types for the Orchestra process orchestration protocol.
//!
//! This crate defines the data shared by every process taking part in an
//! orchestration: message identities and classifiers, the message catalogue,
//! peer identities and configuration. It contains no I/O.

pub mod client;
pub mod config;
pub mod message;

pub use client::{ClientId, ClientIdentity, ClientRole, ConnectionEntry, ServerIdentity};
pub use config::{CasConfig, OrchestrationConfig};
pub use message::{
    Classifier, MessageBody, MessageId, MessageKind, OrchestrationMessage, ProtocolVersion,
};
