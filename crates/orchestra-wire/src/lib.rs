//! Orchestra wire protocol: process orchestration over loopback TCP.
//!
//! Connects the processes taking part in a development session (tooling,
//! the running application, the compiler daemon) so they can exchange typed
//! messages and share replicated state.
//!
//! ## Architecture
//!
//! - **Frame / codec**: length-prefixed frames; classifier-encoded messages,
//!   with anything undecodable surfaced as an opaque, forwardable message
//! - **Connection**: one TCP stream with a FIFO writer and a dispatching reader
//! - **OrchestrationServer**: accepts many clients, broadcasts, owns state
//! - **OrchestrationClient**: one connection to one peer, mirrors state
//! - **OrchestrationListener**: hands out accepted connections one at a time
//! - **State**: compare-and-set replicated values, including the
//!   connections directory

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handle;
pub(crate) mod handshake;
pub mod listener;
pub mod registry;
pub mod server;
pub mod state;
pub mod subscription;

pub use client::{connect_client, OrchestrationClient};
pub use connection::{Connection, ConnectionId, ConnectionState, RemotePeer};
pub use directory::{directory_state, ConnectionDirectory};
pub use envelope::{AnyMessage, OpaqueMessage};
pub use error::{StateError, StateResult, WireError, WireResult};
pub use frame::{Frame, PackageType};
pub use handle::OrchestrationHandle;
pub use listener::OrchestrationListener;
pub use registry::MessageRegistry;
pub use server::{start_server, ConnectionInfo, OrchestrationServer};
pub use state::{CasPolicy, StateCell, StateHandle, StateId, StateKey, StateValue};
pub use subscription::{Dispatcher, Subscription, TypedSubscription};
