//! One framed TCP connection.
//!
//! Each connection runs two tasks: a writer draining a FIFO queue of frames
//! and a reader that routes ordinary frames to the subscriber dispatcher and
//! state frames to the state engine. Closing is idempotent and wakes both.

use crate::codec;
use crate::envelope::AnyMessage;
use crate::error::{WireError, WireResult};
use crate::frame::{read_frame, write_frame, Frame};
use crate::handshake;
use crate::registry::MessageRegistry;
use crate::state::engine::EngineLink;
use crate::state::frame::StateFrame;
use crate::subscription::{Dispatcher, Subscription};
use orchestra_types::{ClientIdentity, ConnectionEntry, ProtocolVersion, ServerIdentity};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    Open,
    Closed,
}

/// Who sits on the other end, as learned from the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemotePeer {
    Client(ClientIdentity),
    Server(ServerIdentity),
}

impl RemotePeer {
    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            Self::Client(identity) => identity.protocol_version,
            Self::Server(identity) => identity.protocol_version,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::Client(identity) => identity.client_pid,
            Self::Server(identity) => identity.server_pid,
        }
    }
}

impl std::fmt::Display for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(identity) => write!(
                f,
                "{} client {} (pid {})",
                identity.client_role, identity.client_id, identity.client_pid
            ),
            Self::Server(identity) => write!(f, "server (pid {})", identity.server_pid),
        }
    }
}

/// Which side of the handshake this end plays.
pub(crate) enum Handshake {
    Dial(ClientIdentity),
    Accept { timeout: Duration },
}

/// Everything a connection shares with its owner.
pub(crate) struct ConnectionSetup {
    pub registry: Arc<MessageRegistry>,
    pub dispatcher: Dispatcher,
    /// Close the dispatcher together with the connection (clients do, servers don't).
    pub owns_dispatcher: bool,
    pub engine: Option<EngineLink>,
    /// List the remote client in the connections directory.
    pub register_in_directory: bool,
    pub max_frame_size: u32,
}

struct WriteRequest {
    frame: Frame,
    done: Option<oneshot::Sender<WireResult<()>>>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    remote: RemotePeer,
    registry: Arc<MessageRegistry>,
    dispatcher: Dispatcher,
    owns_dispatcher: bool,
    engine: Option<EngineLink>,
    max_frame_size: u32,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    state: watch::Sender<ConnectionState>,
    closing: watch::Sender<bool>,
    closed: AtomicBool,
}

/// Cheaply cloneable handle to a live (or closed) connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Run the handshake over `stream` and start the reader and writer tasks.
    pub(crate) async fn establish(
        stream: TcpStream,
        handshake: Handshake,
        setup: ConnectionSetup,
    ) -> WireResult<Self> {
        let id = ConnectionId::next();
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        debug!(conn = %id, %peer_addr, "orchestra: connecting");

        let (mut reader, mut writer) = stream.into_split();
        let max_frame_size = setup.max_frame_size;
        let remote = match handshake {
            Handshake::Dial(identity) => RemotePeer::Server(
                handshake::dial(&mut reader, &mut writer, &identity, max_frame_size).await?,
            ),
            Handshake::Accept { timeout } => {
                let accepted = tokio::time::timeout(
                    timeout,
                    handshake::accept(&mut reader, &mut writer, max_frame_size),
                )
                .await
                .map_err(|_| {
                    WireError::HandshakeFailed(format!("no handshake within {timeout:?}"))
                })?;
                RemotePeer::Client(accepted?)
            }
        };
        state.send_replace(ConnectionState::Open);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer_addr,
                remote,
                registry: setup.registry,
                dispatcher: setup.dispatcher,
                owns_dispatcher: setup.owns_dispatcher,
                engine: setup.engine,
                max_frame_size,
                write_tx,
                state,
                closing,
                closed: AtomicBool::new(false),
            }),
        };

        // Attach before the reader starts so the engine sees the connection
        // ahead of any state frame it delivers.
        if let Some(engine) = &connection.inner.engine {
            let entry = match (&connection.inner.remote, setup.register_in_directory) {
                (RemotePeer::Client(identity), true) => Some(ConnectionEntry::from(identity)),
                _ => None,
            };
            engine.attach(connection.clone(), entry);
        }

        tokio::spawn(write_loop(Arc::clone(&connection.inner), writer, write_rx));
        tokio::spawn(read_loop(Arc::clone(&connection.inner), reader));

        info!(
            conn = %id,
            %peer_addr,
            remote = %connection.inner.remote,
            "orchestra: connection open"
        );
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn remote(&self) -> &RemotePeer {
        &self.inner.remote
    }

    /// The remote client's identity, if this end accepted the connection.
    pub fn client_identity(&self) -> Option<&ClientIdentity> {
        match &self.inner.remote {
            RemotePeer::Client(identity) => Some(identity),
            RemotePeer::Server(_) => None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Encode and send a message, resolving once it is written to the socket.
    pub async fn send(&self, message: &AnyMessage) -> WireResult<()> {
        let frame = codec::encode_any(&self.inner.registry, message)?;
        self.send_prepared(message, frame).await
    }

    /// Send a frame already encoded from `message`.
    pub(crate) async fn send_prepared(&self, message: &AnyMessage, frame: Frame) -> WireResult<()> {
        if let AnyMessage::Known(message) = message {
            let since = message.available_since();
            let peer = self.inner.remote.protocol_version();
            if since > peer {
                debug!(
                    conn = %self.inner.id,
                    classifier = %message.classifier(),
                    %since,
                    %peer,
                    "orchestra: peer predates this message type, it will see it as opaque"
                );
            }
        }
        self.send_frame(frame).await
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> WireResult<()> {
        let (done, written) = oneshot::channel();
        self.enqueue(frame, Some(done))?;
        written.await.unwrap_or(Err(WireError::ConnectionClosed))
    }

    /// Queue a frame without waiting for the write.
    pub(crate) fn send_frame_nowait(&self, frame: Frame) -> WireResult<()> {
        self.enqueue(frame, None)
    }

    fn enqueue(&self, frame: Frame, done: Option<oneshot::Sender<WireResult<()>>>) -> WireResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WireError::ConnectionClosed);
        }
        // The peer drops the connection on a frame over its limit.
        frame.check_size(self.inner.max_frame_size)?;
        self.inner
            .write_tx
            .send(WriteRequest { frame, done })
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Messages received on this connection.
    pub fn subscribe(&self) -> Subscription {
        self.inner.dispatcher.subscribe()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.finish();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionInner {
    fn dispatch(&self, frame: Frame) {
        if frame.package_type.is_state() {
            match StateFrame::decode(&frame) {
                Ok(state_frame) => match &self.engine {
                    Some(engine) => engine.frame(self.id, state_frame),
                    None => debug!(conn = %self.id, "orchestra: no state engine, dropping state frame"),
                },
                Err(e) => warn!(
                    conn = %self.id,
                    package_type = ?frame.package_type,
                    "orchestra: failed decoding state frame: {e}"
                ),
            }
            return;
        }
        let message = codec::decode_frame(&self.registry, frame);
        self.dispatcher.publish(&message);
    }

    /// Transition to `Closed` exactly once.
    fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.send_replace(true);
        self.state.send_replace(ConnectionState::Closed);
        if self.owns_dispatcher {
            self.dispatcher.close();
        }
        if let Some(engine) = &self.engine {
            engine.closed(self.id);
        }
        info!(conn = %self.id, peer_addr = %self.peer_addr, "orchestra: connection closed");
    }
}

/// Resolves once `signal` turns `true` (or its sender is gone).
pub(crate) async fn wait_signal(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|set| *set).await;
}

async fn write_loop(
    inner: Arc<ConnectionInner>,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
) {
    let mut closing = inner.closing.subscribe();
    loop {
        let request = tokio::select! {
            _ = wait_signal(&mut closing) => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = wait_signal(&mut closing) => Err(WireError::ConnectionClosed),
            result = write_frame(&mut writer, &request.frame) => result,
        };
        let failed = result.is_err();
        if let Err(e) = &result {
            debug!(conn = %inner.id, "orchestra: write failed: {e}");
        }
        if let Some(done) = request.done {
            let _ = done.send(result);
        }
        if failed {
            inner.finish();
            break;
        }
    }

    let _ = writer.shutdown().await;
    queue.close();
    while let Ok(request) = queue.try_recv() {
        if let Some(done) = request.done {
            let _ = done.send(Err(WireError::ConnectionClosed));
        }
    }
}

async fn read_loop(inner: Arc<ConnectionInner>, mut reader: OwnedReadHalf) {
    let mut closing = inner.closing.subscribe();
    loop {
        let result = tokio::select! {
            _ = wait_signal(&mut closing) => break,
            result = read_frame(&mut reader, inner.max_frame_size) => result,
        };
        match result {
            Ok(frame) => inner.dispatch(frame),
            Err(WireError::ConnectionClosed) => {
                debug!(conn = %inner.id, "orchestra: peer closed the connection");
                break;
            }
            Err(e) => {
                debug!(conn = %inner.id, "orchestra: read failed: {e}");
                break;
            }
        }
    }
    inner.finish();
}
