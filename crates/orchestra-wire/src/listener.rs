//! Accept incoming connections one client at a time.
//!
//! Unlike [`OrchestrationServer`](crate::server::OrchestrationServer), a
//! listener hands every accepted connection out as an independent
//! [`OrchestrationClient`]. It holds at most one accepted-but-unclaimed
//! client; the socket is not accepted from again until that one is taken.

use crate::client::OrchestrationClient;
use crate::connection::{wait_signal, Connection, ConnectionSetup, Handshake};
use crate::error::WireResult;
use crate::handle::OrchestrationHandle;
use crate::registry::MessageRegistry;
use crate::state::engine::{self, EngineRole};
use crate::state::{CasPolicy, StateHandle};
use crate::subscription::Dispatcher;
use orchestra_types::OrchestrationConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound socket yielding one [`OrchestrationClient`] per accepted peer.
pub struct OrchestrationListener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<OrchestrationClient>>,
    shutdown: watch::Sender<bool>,
}

impl OrchestrationListener {
    pub async fn bind(config: &OrchestrationConfig) -> WireResult<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!("orchestra: listener bound to {}", local_addr);

        let (slot, accepted) = mpsc::channel(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(
            listener,
            config.clone(),
            Arc::new(MessageRegistry::with_defaults()),
            slot,
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            accepted: Mutex::new(accepted),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Next handshaken client, or `None` once the listener is closed.
    pub async fn accept(&self) -> Option<OrchestrationClient> {
        self.accepted.lock().await.recv().await
    }

    /// Stop accepting. Clients already handed out stay open.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for OrchestrationListener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: OrchestrationConfig,
    registry: Arc<MessageRegistry>,
    slot: mpsc::Sender<OrchestrationClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Wait for the slot to free up before taking the next connection.
        let permit = tokio::select! {
            _ = wait_signal(&mut shutdown) => break,
            permit = slot.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (stream, addr) = tokio::select! {
            _ = wait_signal(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("orchestra: accept error: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        match accept_client(stream, &config, &registry).await {
            Ok(client) => {
                if *shutdown.borrow() {
                    client.close().await;
                    break;
                }
                debug!("orchestra: listener accepted client from {}", addr);
                permit.send(client);
            }
            Err(e) => debug!("orchestra: handshake with {} failed: {}", addr, e),
        }
    }
    debug!("orchestra: listener accept loop stopped");
}

async fn accept_client(
    stream: TcpStream,
    config: &OrchestrationConfig,
    registry: &Arc<MessageRegistry>,
) -> WireResult<OrchestrationClient> {
    let dispatcher = Dispatcher::new();
    let (engine, _task) = engine::spawn(EngineRole::Authority, true);
    let setup = ConnectionSetup {
        registry: Arc::clone(registry),
        dispatcher: dispatcher.clone(),
        owns_dispatcher: true,
        engine: Some(engine.clone()),
        register_in_directory: false,
        max_frame_size: config.max_frame_size,
    };
    let handshake = Handshake::Accept {
        timeout: config.handshake_timeout(),
    };
    let connection = match Connection::establish(stream, handshake, setup).await {
        Ok(connection) => connection,
        Err(e) => {
            engine.shutdown();
            return Err(e);
        }
    };
    let states = StateHandle::new(engine, CasPolicy::from(&config.cas));
    Ok(OrchestrationClient::accepted(connection, dispatcher, states))
}
