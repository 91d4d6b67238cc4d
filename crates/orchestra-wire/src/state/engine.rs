//! The state coordinator.
//!
//! One task per peer owns every state cell. Local commands and events from
//! connections arrive on a single queue, so an attach is always seen before
//! the frames and the close of the same connection.

use super::frame::StateFrame;
use super::{decode_value, encode_value, StateKey};
use crate::connection::{Connection, ConnectionId};
use crate::directory::{directory_state, ConnectionDirectory};
use crate::error::{StateError, StateResult, WireError, WireResult};
use bytes::Bytes;
use orchestra_types::ConnectionEntry;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether this peer owns the values or mirrors someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineRole {
    /// Holds the authoritative value; decides compare-and-set.
    Authority,
    /// Forwards updates to the single upstream connection.
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateOutcome {
    Accepted,
    Rejected,
}

enum EngineInput {
    Snapshot {
        key: StateKey,
        reply: oneshot::Sender<watch::Receiver<Bytes>>,
    },
    Update {
        key: StateKey,
        expected: Bytes,
        updated: Bytes,
        reply: oneshot::Sender<StateResult<UpdateOutcome>>,
    },
    Refresh {
        key: StateKey,
        reply: oneshot::Sender<StateResult<()>>,
    },
    Attach {
        connection: Connection,
        entry: Option<ConnectionEntry>,
    },
    Frame {
        from: ConnectionId,
        frame: StateFrame,
    },
    Closed {
        connection: ConnectionId,
    },
    Shutdown,
}

/// Sending side of the coordinator queue.
#[derive(Clone)]
pub(crate) struct EngineLink {
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl EngineLink {
    fn send(&self, input: EngineInput) -> StateResult<()> {
        self.tx.send(input).map_err(|_| StateError::EngineStopped)
    }

    pub(crate) async fn snapshot(&self, key: StateKey) -> StateResult<watch::Receiver<Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Snapshot { key, reply })?;
        rx.await.map_err(|_| StateError::EngineStopped)
    }

    pub(crate) async fn update(
        &self,
        key: StateKey,
        expected: Bytes,
        updated: Bytes,
    ) -> StateResult<UpdateOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Update {
            key,
            expected,
            updated,
            reply,
        })?;
        rx.await.map_err(|_| StateError::EngineStopped)?
    }

    /// Resolves once the local copy of `key` reflects the authority's value.
    pub(crate) async fn refresh(&self, key: StateKey) -> StateResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineInput::Refresh { key, reply })?;
        rx.await.map_err(|_| StateError::EngineStopped)?
    }

    pub(crate) fn attach(&self, connection: Connection, entry: Option<ConnectionEntry>) {
        let _ = self.send(EngineInput::Attach { connection, entry });
    }

    pub(crate) fn frame(&self, from: ConnectionId, frame: StateFrame) {
        let _ = self.send(EngineInput::Frame { from, frame });
    }

    pub(crate) fn closed(&self, connection: ConnectionId) {
        let _ = self.send(EngineInput::Closed { connection });
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.send(EngineInput::Shutdown);
    }
}

/// A frame that could not go upstream, as seen by the caller of `update`.
fn state_error(e: WireError) -> StateError {
    match e {
        WireError::ConnectionClosed => StateError::ConnectionClosed,
        other => StateError::Encode(other.to_string()),
    }
}

/// Start a coordinator task.
///
/// With `stop_when_detached` the task ends as soon as its last connection
/// closes, which is what single-connection peers want.
pub(crate) fn spawn(role: EngineRole, stop_when_detached: bool) -> (EngineLink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine {
        role,
        stop_when_detached,
        cells: HashMap::new(),
        connections: HashMap::new(),
        directory: HashMap::new(),
        pending_updates: HashMap::new(),
        pending_refreshes: HashMap::new(),
    };
    let handle = tokio::spawn(engine.run(rx));
    (EngineLink { tx }, handle)
}

struct Cell {
    value: watch::Sender<Bytes>,
    /// Connections that receive a `Value` push whenever this cell changes.
    mirrors: HashSet<ConnectionId>,
}

impl Cell {
    fn new() -> Self {
        let (value, _) = watch::channel(Bytes::new());
        Self {
            value,
            mirrors: HashSet::new(),
        }
    }
}

struct PendingUpdate {
    key: StateKey,
    updated: Bytes,
    reply: oneshot::Sender<StateResult<UpdateOutcome>>,
}

struct Engine {
    role: EngineRole,
    stop_when_detached: bool,
    cells: HashMap<StateKey, Cell>,
    connections: HashMap<ConnectionId, Connection>,
    directory: HashMap<ConnectionId, ConnectionEntry>,
    pending_updates: HashMap<Uuid, PendingUpdate>,
    pending_refreshes: HashMap<StateKey, Vec<oneshot::Sender<StateResult<()>>>>,
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineInput>) {
        debug!(role = ?self.role, "orchestra: state engine started");
        while let Some(input) = rx.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        // Dropping the cells ends every StateCell; dropping the replies
        // fails every in-flight update with EngineStopped.
        debug!(role = ?self.role, "orchestra: state engine stopped");
    }

    /// Returns `false` when the engine should stop.
    fn handle(&mut self, input: EngineInput) -> bool {
        match input {
            EngineInput::Snapshot { key, reply } => {
                self.ensure_cell(&key);
                if let Some(cell) = self.cells.get(&key) {
                    let _ = reply.send(cell.value.subscribe());
                }
            }
            EngineInput::Update {
                key,
                expected,
                updated,
                reply,
            } => self.local_update(key, expected, updated, reply),
            EngineInput::Refresh { key, reply } => self.refresh(key, reply),
            EngineInput::Attach { connection, entry } => self.attach(connection, entry),
            EngineInput::Frame { from, frame } => self.remote_frame(from, frame),
            EngineInput::Closed { connection } => return self.detach(connection),
            EngineInput::Shutdown => return false,
        }
        true
    }

    /// Create the cell for `key` if needed. A mirror asks upstream for the
    /// value of every cell it creates.
    fn ensure_cell(&mut self, key: &StateKey) {
        if self.cells.contains_key(key) {
            return;
        }
        self.cells.insert(key.clone(), Cell::new());
        if self.role == EngineRole::Mirror {
            let _ = self.send_upstream(StateFrame::Request { key: key.clone() });
        }
    }

    fn upstream(&self) -> Option<ConnectionId> {
        self.connections.keys().next().copied()
    }

    fn send_upstream(&self, frame: StateFrame) -> WireResult<()> {
        match self.upstream() {
            Some(id) => self.send_to(id, frame),
            None => Err(WireError::ConnectionClosed),
        }
    }

    fn send_to(&self, id: ConnectionId, frame: StateFrame) -> WireResult<()> {
        let Some(connection) = self.connections.get(&id) else {
            return Err(WireError::ConnectionClosed);
        };
        let result = frame
            .encode()
            .and_then(|frame| connection.send_frame_nowait(frame));
        match &result {
            Ok(()) => {}
            Err(WireError::ConnectionClosed) => {
                debug!(conn = %id, "orchestra: dropping state frame, connection closed")
            }
            Err(e) => warn!(conn = %id, "orchestra: dropping state frame: {e}"),
        }
        result
    }

    /// Authority-side compare-and-set. `origin` is the connection that asked,
    /// if any; it becomes a mirror and is not pushed its own value back.
    fn compare_and_set(
        &mut self,
        key: &StateKey,
        expected: &Bytes,
        updated: Bytes,
        origin: Option<ConnectionId>,
    ) -> UpdateOutcome {
        let cell = self.cells.entry(key.clone()).or_insert_with(Cell::new);
        if let Some(origin) = origin {
            cell.mirrors.insert(origin);
        }
        if *cell.value.borrow() != *expected {
            debug!(state = %key, "orchestra: rejected stale state update");
            return UpdateOutcome::Rejected;
        }
        cell.value.send_replace(updated.clone());

        let targets: Vec<ConnectionId> = cell
            .mirrors
            .iter()
            .copied()
            .filter(|id| Some(*id) != origin)
            .collect();
        for id in targets {
            let _ = self.send_to(
                id,
                StateFrame::Value {
                    key: key.clone(),
                    value: updated.clone(),
                },
            );
        }
        UpdateOutcome::Accepted
    }

    fn local_update(
        &mut self,
        key: StateKey,
        expected: Bytes,
        updated: Bytes,
        reply: oneshot::Sender<StateResult<UpdateOutcome>>,
    ) {
        match self.role {
            EngineRole::Authority => {
                let outcome = self.compare_and_set(&key, &expected, updated, None);
                let _ = reply.send(Ok(outcome));
            }
            EngineRole::Mirror => {
                let update_id = Uuid::new_v4();
                let frame = StateFrame::Update {
                    update_id,
                    key: key.clone(),
                    expected,
                    updated: updated.clone(),
                };
                if let Err(e) = self.send_upstream(frame) {
                    let _ = reply.send(Err(state_error(e)));
                    return;
                }
                self.pending_updates.insert(
                    update_id,
                    PendingUpdate {
                        key,
                        updated,
                        reply,
                    },
                );
            }
        }
    }

    fn refresh(&mut self, key: StateKey, reply: oneshot::Sender<StateResult<()>>) {
        if self.role == EngineRole::Authority {
            let _ = reply.send(Ok(()));
            return;
        }
        self.ensure_cell(&key);
        if let Err(e) = self.send_upstream(StateFrame::Request { key: key.clone() }) {
            let _ = reply.send(Err(state_error(e)));
            return;
        }
        self.pending_refreshes.entry(key).or_default().push(reply);
    }

    fn remote_frame(&mut self, from: ConnectionId, frame: StateFrame) {
        match frame {
            StateFrame::Request { key } => {
                let cell = self.cells.entry(key.clone()).or_insert_with(Cell::new);
                cell.mirrors.insert(from);
                let value = cell.value.borrow().clone();
                let _ = self.send_to(from, StateFrame::Value { key, value });
            }
            StateFrame::Update {
                update_id,
                key,
                expected,
                updated,
            } => {
                let outcome = self.compare_and_set(&key, &expected, updated, Some(from));
                let _ = self.send_to(
                    from,
                    StateFrame::UpdateResponse {
                        update_id,
                        accepted: outcome == UpdateOutcome::Accepted,
                    },
                );
            }
            StateFrame::UpdateResponse {
                update_id,
                accepted,
            } => {
                let Some(pending) = self.pending_updates.remove(&update_id) else {
                    debug!(%update_id, "orchestra: response for unknown state update");
                    return;
                };
                let outcome = if accepted {
                    if let Some(cell) = self.cells.get(&pending.key) {
                        cell.value.send_replace(pending.updated);
                    }
                    UpdateOutcome::Accepted
                } else {
                    UpdateOutcome::Rejected
                };
                let _ = pending.reply.send(Ok(outcome));
            }
            StateFrame::Value { key, value } => {
                if self.role == EngineRole::Authority {
                    debug!(state = %key, conn = %from, "orchestra: ignoring pushed value on authority");
                    return;
                }
                self.cells
                    .entry(key.clone())
                    .or_insert_with(Cell::new)
                    .value
                    .send_replace(value);
                for reply in self.pending_refreshes.remove(&key).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn attach(&mut self, connection: Connection, entry: Option<ConnectionEntry>) {
        let id = connection.id();
        self.connections.insert(id, connection);
        if self.role == EngineRole::Mirror {
            // Cells created before the upstream existed still need a value.
            let keys: Vec<StateKey> = self.cells.keys().cloned().collect();
            for key in keys {
                let _ = self.send_to(id, StateFrame::Request { key });
            }
        }
        if let Some(entry) = entry {
            self.directory.insert(id, entry.clone());
            self.edit_directory(|directory| {
                directory.connections.insert(entry);
            });
        }
    }

    /// Returns `false` when the engine should stop.
    fn detach(&mut self, id: ConnectionId) -> bool {
        if self.connections.remove(&id).is_none() {
            return true;
        }
        for cell in self.cells.values_mut() {
            cell.mirrors.remove(&id);
        }
        if let Some(entry) = self.directory.remove(&id) {
            // Connections dialed with the same identity share one entry.
            if !self.directory.values().any(|other| *other == entry) {
                self.edit_directory(|directory| {
                    directory.connections.remove(&entry);
                });
            }
        }
        if self.role == EngineRole::Mirror && self.connections.is_empty() {
            for (_, pending) in self.pending_updates.drain() {
                let _ = pending.reply.send(Err(StateError::ConnectionClosed));
            }
            for (_, replies) in self.pending_refreshes.drain() {
                for reply in replies {
                    let _ = reply.send(Err(StateError::ConnectionClosed));
                }
            }
        }
        !(self.stop_when_detached && self.connections.is_empty())
    }

    /// Rewrite the connections directory through the regular
    /// compare-and-set path so mirrors get the new value pushed.
    fn edit_directory(&mut self, edit: impl FnOnce(&mut ConnectionDirectory)) {
        let key = directory_state().key().clone();
        let expected = self
            .cells
            .entry(key.clone())
            .or_insert_with(Cell::new)
            .value
            .borrow()
            .clone();
        let mut directory = decode_value::<ConnectionDirectory>(&expected).unwrap_or_else(|e| {
            warn!("orchestra: connections directory unreadable, rebuilding: {e}");
            ConnectionDirectory::default()
        });
        edit(&mut directory);
        let updated = match encode_value(&directory) {
            Ok(updated) => updated,
            Err(e) => {
                warn!("orchestra: failed encoding connections directory: {e}");
                return;
            }
        };
        let outcome = self.compare_and_set(&key, &expected, updated, None);
        debug_assert_eq!(outcome, UpdateOutcome::Accepted);
        info!(
            connections = directory.len(),
            "orchestra: connections directory updated"
        );
    }
}
