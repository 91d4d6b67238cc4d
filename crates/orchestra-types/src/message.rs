//! Orchestration message catalogue.
//!
//! Every message travels on the wire under a [`Classifier`] (a namespace and
//! a type string) rather than a Rust type name, so independently versioned
//! processes agree on identity without sharing a build. Each variant also
//! records the protocol version it first appeared in.

use crate::client::ClientRole;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Globally unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the hyphenated textual form used on the wire.
    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire identity of a message variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Classifier {
    /// Namespace, e.g. `"reload"`.
    pub namespace: Cow<'static, str>,
    /// Type within the namespace, e.g. `"ReloadRequest"`.
    pub kind: Cow<'static, str>,
}

impl Classifier {
    /// Classifier built from static strings (usable in `const` context).
    pub const fn new(namespace: &'static str, kind: &'static str) -> Self {
        Self {
            namespace: Cow::Borrowed(namespace),
            kind: Cow::Borrowed(kind),
        }
    }

    /// Classifier built from strings read off the wire.
    pub fn owned(namespace: String, kind: String) -> Self {
        Self {
            namespace: Cow::Owned(namespace),
            kind: Cow::Owned(kind),
        }
    }
}

impl std::fmt::Display for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.kind)
    }
}

/// Protocol revision a message variant (or a peer) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const V1_0_0: Self = Self::new(1, 0, 0);
    pub const V1_1_0: Self = Self::new(1, 1, 0);
    pub const V1_2_0: Self = Self::new(1, 2, 0);

    /// The revision implemented by this build.
    pub const CURRENT: Self = Self::V1_2_0;

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A payload type that can be carried by an [`OrchestrationMessage`].
///
/// Implemented for every struct of the catalogue below; the wire crate builds
/// its classifier registry from these associated constants.
pub trait MessageBody:
    Serialize + DeserializeOwned + Into<MessageKind> + Clone + Send + Sync + 'static
{
    /// Wire identity of this payload type.
    const CLASSIFIER: Classifier;
    /// First protocol revision that carries this payload type.
    const AVAILABLE_SINCE: ProtocolVersion;

    /// Borrow the payload if `kind` is this variant.
    fn from_kind(kind: &MessageKind) -> Option<&Self>;
}

/// Identifier of an application window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(pub String);

/// How a file changed between two builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Severity of a forwarded log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Code changed on disk; the application should reload the listed files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReloadRequest {
    /// Changed file path -> kind of change.
    pub changed_files: BTreeMap<String, ChangeKind>,
}

/// Outcome of applying a [`ReloadRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResult {
    /// Id of the request this result answers.
    pub reload_request_id: MessageId,
    pub is_success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_stacktrace: Vec<String>,
}

/// A log line forwarded from another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Source tag, e.g. `"compiler"` or `"agent"`.
    pub tag: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStarted;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFinished;

/// Result of a single build task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTaskResult {
    pub task_id: String,
    pub is_success: bool,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
    #[serde(default)]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecompileRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecompileResult {
    pub recompile_request_id: MessageId,
    /// Exit code of the build tool, `None` if it did not run to completion.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// The UI finished rendering a frame (optionally the first after a reload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiRendered {
    #[serde(default)]
    pub window_id: Option<WindowId>,
    #[serde(default)]
    pub reload_request_id: Option<MessageId>,
    pub iteration: u32,
}

/// Rendering threw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiException {
    #[serde(default)]
    pub window_id: Option<WindowId>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stacktrace: Vec<String>,
}

/// Geometry report for an application window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPositioned {
    pub window_id: WindowId,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_always_on_top: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGone {
    pub window_id: WindowId,
}

/// Ask every process in the orchestration to exit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// An unrecoverable failure in one of the processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalException {
    pub client_role: ClientRole,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub exception_class_name: Option<String>,
    #[serde(default)]
    pub stacktrace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub acknowledged_message_id: MessageId,
}

/// Test-only event with an arbitrary binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEvent {
    pub payload: Vec<u8>,
}

macro_rules! message_catalogue {
    ($( $(#[$meta:meta])* $variant:ident => ($ns:literal, $ty:literal, $since:ident) ),+ $(,)?) => {
        /// Closed set of messages this build understands.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum MessageKind {
            $( $(#[$meta])* $variant($variant), )+
        }

        impl MessageKind {
            /// Wire identity of this variant.
            pub fn classifier(&self) -> Classifier {
                match self {
                    $( Self::$variant(_) => <$variant as MessageBody>::CLASSIFIER, )+
                }
            }

            /// First protocol revision that carries this variant.
            pub fn available_since(&self) -> ProtocolVersion {
                match self {
                    $( Self::$variant(_) => <$variant as MessageBody>::AVAILABLE_SINCE, )+
                }
            }
        }

        $(
            impl From<$variant> for MessageKind {
                fn from(body: $variant) -> Self {
                    Self::$variant(body)
                }
            }

            impl MessageBody for $variant {
                const CLASSIFIER: Classifier = Classifier::new($ns, $ty);
                const AVAILABLE_SINCE: ProtocolVersion = ProtocolVersion::$since;

                fn from_kind(kind: &MessageKind) -> Option<&Self> {
                    match kind {
                        MessageKind::$variant(body) => Some(body),
                        _ => None,
                    }
                }
            }
        )+
    };
}

message_catalogue! {
    /// Code-change notification.
    ReloadRequest => ("reload", "ReloadRequest", V1_0_0),
    /// Reload outcome, correlated by request id.
    ReloadResult => ("reload", "ReloadResult", V1_0_0),
    LogMessage => ("core", "LogMessage", V1_0_0),
    BuildStarted => ("build", "BuildStarted", V1_0_0),
    BuildFinished => ("build", "BuildFinished", V1_0_0),
    BuildTaskResult => ("build", "BuildTaskResult", V1_1_0),
    RecompileRequest => ("build", "RecompileRequest", V1_0_0),
    RecompileResult => ("build", "RecompileResult", V1_0_0),
    UiRendered => ("ui", "UIRendered", V1_0_0),
    UiException => ("ui", "UIException", V1_0_0),
    WindowPositioned => ("ui", "ApplicationWindowPositioned", V1_0_0),
    WindowGone => ("ui", "ApplicationWindowGone", V1_1_0),
    ShutdownRequest => ("core", "ShutdownRequest", V1_0_0),
    CriticalException => ("core", "CriticalException", V1_2_0),
    Ping => ("core", "Ping", V1_0_0),
    Ack => ("core", "Ack", V1_0_0),
    /// Only used by tests; carries arbitrary bytes.
    TestEvent => ("test", "TestEvent", V1_0_0),
}

/// A message with its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationMessage {
    /// Assigned at construction; used for correlation and acknowledgement.
    pub message_id: MessageId,
    pub kind: MessageKind,
}

impl OrchestrationMessage {
    /// Wrap a payload under a fresh id.
    pub fn new(kind: impl Into<MessageKind>) -> Self {
        Self {
            message_id: MessageId::new(),
            kind: kind.into(),
        }
    }

    /// Wrap a payload under an existing id (used when decoding).
    pub fn with_id(message_id: MessageId, kind: impl Into<MessageKind>) -> Self {
        Self {
            message_id,
            kind: kind.into(),
        }
    }

    pub fn classifier(&self) -> Classifier {
        self.kind.classifier()
    }

    pub fn available_since(&self) -> ProtocolVersion {
        self.kind.available_since()
    }

    /// Borrow the payload as `T` if this message carries one.
    pub fn body<T: MessageBody>(&self) -> Option<&T> {
        T::from_kind(&self.kind)
    }
}
