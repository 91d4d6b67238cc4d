//! Orchestration server: accepts any number of clients, broadcasts to all of
//! them, and is the authority for the state they share.

use crate::codec;
use crate::connection::{wait_signal, Connection, ConnectionId, ConnectionSetup, Handshake};
use crate::envelope::AnyMessage;
use crate::error::{WireError, WireResult};
use crate::handle::OrchestrationHandle;
use crate::registry::MessageRegistry;
use crate::state::engine::{self, EngineLink, EngineRole};
use crate::state::{CasPolicy, StateHandle};
use crate::subscription::Dispatcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orchestra_types::{ConnectionEntry, OrchestrationConfig, ProtocolVersion};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A connected client as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub entry: ConnectionEntry,
    pub address: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub connected_at: DateTime<Utc>,
}

struct ServerShared {
    config: OrchestrationConfig,
    registry: Arc<MessageRegistry>,
    dispatcher: Dispatcher,
    engine: EngineLink,
    connections: DashMap<ConnectionId, (Connection, ConnectionInfo)>,
    closed: AtomicBool,
}

/// Listening orchestration server.
pub struct OrchestrationServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    states: StateHandle,
    shutdown: watch::Sender<bool>,
}

impl OrchestrationServer {
    /// Bind `config.socket_addr()` and start accepting clients.
    pub async fn start(config: OrchestrationConfig) -> WireResult<Self> {
        Self::start_with_registry(config, MessageRegistry::with_defaults()).await
    }

    pub async fn start_with_registry(
        config: OrchestrationConfig,
        registry: MessageRegistry,
    ) -> WireResult<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!("orchestra: server listening on {}", local_addr);

        let (engine, _task) = engine::spawn(EngineRole::Authority, false);
        let states = StateHandle::new(engine.clone(), CasPolicy::from(&config.cas));
        let shared = Arc::new(ServerShared {
            config,
            registry: Arc::new(registry),
            dispatcher: Dispatcher::new(),
            engine,
            connections: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(Self::accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            local_addr,
            states,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port (useful when the config asked for port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Clients connected right now.
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .shared
            .connections
            .iter()
            .map(|e| e.value().1.clone())
            .collect();
        infos.sort_by_key(|info| info.connection_id);
        infos
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    async fn accept_loop(
        listener: TcpListener,
        shared: Arc<ServerShared>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = wait_signal(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("orchestra: accepted connection from {}", addr);
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_inbound(stream, addr, &shared).await {
                            debug!("orchestra: inbound connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("orchestra: accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        debug!("orchestra: accept loop stopped");
    }

    /// Handshake one client, track it until it disconnects.
    async fn handle_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        shared: &ServerShared,
    ) -> WireResult<()> {
        let setup = ConnectionSetup {
            registry: Arc::clone(&shared.registry),
            dispatcher: shared.dispatcher.clone(),
            owns_dispatcher: false,
            engine: Some(shared.engine.clone()),
            register_in_directory: true,
            max_frame_size: shared.config.max_frame_size,
        };
        let handshake = Handshake::Accept {
            timeout: shared.config.handshake_timeout(),
        };
        let connection = Connection::establish(stream, handshake, setup).await?;
        let identity = connection
            .client_identity()
            .cloned()
            .ok_or_else(|| WireError::HandshakeFailed("peer did not identify".into()))?;

        let id = connection.id();
        shared.connections.insert(
            id,
            (
                connection.clone(),
                ConnectionInfo {
                    connection_id: id,
                    entry: ConnectionEntry::from(&identity),
                    address: addr,
                    protocol_version: identity.protocol_version,
                    connected_at: Utc::now(),
                },
            ),
        );
        // close() may have swept the table before this insert.
        if shared.closed.load(Ordering::SeqCst) {
            connection.close();
        }
        info!(
            conn = %id,
            client = %identity.client_id,
            role = %identity.client_role,
            pid = identity.client_pid,
            "orchestra: client connected from {}", addr
        );

        connection.closed().await;
        shared.connections.remove(&id);
        info!(conn = %id, client = %identity.client_id, "orchestra: client disconnected");
        Ok(())
    }
}

#[async_trait]
impl OrchestrationHandle for OrchestrationServer {
    /// Broadcast to every client. Failures on individual connections are
    /// logged; the call only fails if the server itself is closed or the
    /// message cannot be encoded within `max_frame_size`.
    async fn send_message(&self, message: AnyMessage) -> WireResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(WireError::ConnectionClosed);
        }
        let frame = codec::encode_any(&self.shared.registry, &message)?;
        frame.check_size(self.shared.config.max_frame_size)?;
        let targets: Vec<Connection> = self
            .shared
            .connections
            .iter()
            .map(|e| e.value().0.clone())
            .collect();

        let sends = targets
            .iter()
            .map(|connection| connection.send_prepared(&message, frame.clone()));
        let results = futures::future::join_all(sends).await;
        for (connection, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                debug!(conn = %connection.id(), "orchestra: broadcast skipped a client: {e}");
            }
        }
        Ok(())
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    fn states(&self) -> &StateHandle {
        &self.states
    }

    fn is_active(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("orchestra: server on {} shutting down", self.local_addr);
        self.shutdown.send_replace(true);
        let connections: Vec<Connection> = self
            .shared
            .connections
            .iter()
            .map(|e| e.value().0.clone())
            .collect();
        for connection in &connections {
            connection.close();
        }
        self.shared.dispatcher.close();
        self.states.shutdown();
    }
}

impl Drop for OrchestrationServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Start a server on `config`.
pub async fn start_server(config: OrchestrationConfig) -> WireResult<OrchestrationServer> {
    OrchestrationServer::start(config).await
}
