//! Client side of an orchestration connection.

use crate::connection::{Connection, ConnectionSetup, Handshake};
use crate::envelope::AnyMessage;
use crate::error::WireResult;
use crate::handle::OrchestrationHandle;
use crate::registry::MessageRegistry;
use crate::state::engine::{self, EngineRole};
use crate::state::{CasPolicy, StateHandle};
use crate::subscription::Dispatcher;
use async_trait::async_trait;
use orchestra_types::{ClientIdentity, ClientRole, OrchestrationConfig};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::info;

/// A single connection to one peer, with its own subscribers and state.
///
/// Clients that dial a server mirror the server's state. Clients handed out
/// by an [`OrchestrationListener`](crate::listener::OrchestrationListener)
/// are the authority for the state they share with the dialer.
pub struct OrchestrationClient {
    identity: Option<ClientIdentity>,
    connection: Connection,
    dispatcher: Dispatcher,
    states: StateHandle,
}

impl OrchestrationClient {
    /// Dial `config.socket_addr()` in the given role.
    pub async fn connect(config: &OrchestrationConfig, role: ClientRole) -> WireResult<Self> {
        Self::connect_as(config, ClientIdentity::current(role)).await
    }

    /// Dial with an explicit identity.
    pub async fn connect_as(
        config: &OrchestrationConfig,
        identity: ClientIdentity,
    ) -> WireResult<Self> {
        Self::connect_with_registry(config, identity, MessageRegistry::with_defaults()).await
    }

    /// Dial with a custom message registry, e.g. one that knows extra types.
    pub async fn connect_with_registry(
        config: &OrchestrationConfig,
        identity: ClientIdentity,
        registry: MessageRegistry,
    ) -> WireResult<Self> {
        let addr = config.socket_addr();
        info!(%addr, role = %identity.client_role, "orchestra: connecting");
        let stream = TcpStream::connect(addr).await?;

        let dispatcher = Dispatcher::new();
        let (engine, _task) = engine::spawn(EngineRole::Mirror, true);
        let setup = ConnectionSetup {
            registry: Arc::new(registry),
            dispatcher: dispatcher.clone(),
            owns_dispatcher: true,
            engine: Some(engine.clone()),
            register_in_directory: false,
            max_frame_size: config.max_frame_size,
        };
        let connection =
            match Connection::establish(stream, Handshake::Dial(identity.clone()), setup).await {
                Ok(connection) => connection,
                Err(e) => {
                    engine.shutdown();
                    return Err(e);
                }
            };

        Ok(Self {
            identity: Some(identity),
            connection,
            dispatcher,
            states: StateHandle::new(engine, CasPolicy::from(&config.cas)),
        })
    }

    pub(crate) fn accepted(
        connection: Connection,
        dispatcher: Dispatcher,
        states: StateHandle,
    ) -> Self {
        Self {
            identity: None,
            connection,
            dispatcher,
            states,
        }
    }

    /// Our own identity, if this client dialed out.
    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.connection.closed().await
    }
}

#[async_trait]
impl OrchestrationHandle for OrchestrationClient {
    async fn send_message(&self, message: AnyMessage) -> WireResult<()> {
        self.connection.send(&message).await
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn states(&self) -> &StateHandle {
        &self.states
    }

    fn is_active(&self) -> bool {
        self.connection.is_open()
    }

    async fn close(&self) {
        self.connection.close();
        self.states.shutdown();
    }
}

impl std::fmt::Debug for OrchestrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationClient")
            .field("identity", &self.identity)
            .field("connection", &self.connection)
            .finish()
    }
}

/// Connect to a server on the loopback interface.
pub async fn connect_client(port: u16, role: ClientRole) -> WireResult<OrchestrationClient> {
    let config = OrchestrationConfig {
        port,
        ..OrchestrationConfig::default()
    };
    OrchestrationClient::connect(&config, role).await
}
