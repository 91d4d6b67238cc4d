//! Peer identity types.

use crate::message::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random ClientId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of process a client is.
///
/// Used by consumers to pick message targets; the transport ignores it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    #[default]
    Unknown,
    /// Developer tooling UI.
    Tooling,
    /// The running application.
    Application,
    /// The build driver.
    Compiler,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Tooling => "tooling",
            Self::Application => "application",
            Self::Compiler => "compiler",
        };
        f.write_str(s)
    }
}

impl FromStr for ClientRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "tooling" => Ok(Self::Tooling),
            "application" | "app" => Ok(Self::Application),
            "compiler" | "build" => Ok(Self::Compiler),
            other => Err(format!("unknown client role '{other}'")),
        }
    }
}

/// Handshake payload a client sends right after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub client_id: ClientId,
    pub client_role: ClientRole,
    pub client_pid: u32,
    pub protocol_version: ProtocolVersion,
}

impl ClientIdentity {
    /// Identity for the current process with a fresh id.
    pub fn current(client_role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            client_role,
            client_pid: std::process::id(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

/// Handshake acknowledgement sent back by the accepting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub server_pid: u32,
    pub protocol_version: ProtocolVersion,
}

impl ServerIdentity {
    pub fn current() -> Self {
        Self {
            server_pid: std::process::id(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

/// One live connection as listed in the connections directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionEntry {
    pub client_id: ClientId,
    pub client_role: ClientRole,
    pub client_pid: u32,
}

impl From<&ClientIdentity> for ConnectionEntry {
    fn from(identity: &ClientIdentity) -> Self {
        Self {
            client_id: identity.client_id,
            client_role: identity.client_role,
            client_pid: identity.client_pid,
        }
    }
}
