//! The connections directory: which clients are attached to a server.

use crate::state::{StateId, StateValue};
use orchestra_types::{ClientId, ClientRole, ConnectionEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of live client connections, maintained by the server as replicated
/// state. Entries appear after the handshake and disappear on disconnect.
///
/// Connections that announce the same identity (e.g. two `connect_as` calls
/// with one [`ClientIdentity`](orchestra_types::ClientIdentity)) share a
/// single entry, which stays until the last of them closes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDirectory {
    pub connections: BTreeSet<ConnectionEntry>,
}

impl ConnectionDirectory {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.get(client_id).is_some()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ConnectionEntry> {
        self.connections.iter().find(|e| e.client_id == client_id)
    }

    pub fn with_role(&self, role: ClientRole) -> impl Iterator<Item = &ConnectionEntry> {
        self.connections.iter().filter(move |e| e.client_role == role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.connections.iter()
    }
}

impl StateValue for ConnectionDirectory {
    const TYPE_NAME: &'static str = "orchestra.ConnectionDirectory";

    fn default_value() -> Self {
        Self::default()
    }
}

/// The one well-known id of the directory state.
pub fn directory_state() -> StateId<ConnectionDirectory> {
    StateId::new()
}
