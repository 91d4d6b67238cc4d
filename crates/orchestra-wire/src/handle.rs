//! Operations shared by servers and clients.

use crate::directory::{directory_state, ConnectionDirectory};
use crate::envelope::AnyMessage;
use crate::error::{StateResult, WireResult};
use crate::state::{StateCell, StateHandle};
use crate::subscription::{Dispatcher, Subscription, TypedSubscription};
use async_trait::async_trait;
use orchestra_types::message::{MessageBody, MessageId, MessageKind, OrchestrationMessage};

/// One end of the orchestration network.
///
/// A server broadcasts to, and receives from, every connected client; a
/// client talks to exactly one peer. Both expose replicated state.
#[async_trait]
pub trait OrchestrationHandle: Send + Sync {
    /// Send a message. Resolves once it has been written to the socket
    /// (for a server: to every connection that was live at the call).
    async fn send_message(&self, message: AnyMessage) -> WireResult<()>;

    /// Where received messages are fanned out.
    fn dispatcher(&self) -> &Dispatcher;

    /// Replicated state of this peer.
    fn states(&self) -> &StateHandle;

    /// `false` once closed, by either side.
    fn is_active(&self) -> bool;

    /// Close the peer. Idempotent.
    async fn close(&self);

    /// Every message received from now on, in receipt order.
    fn subscribe(&self) -> Subscription {
        self.dispatcher().subscribe()
    }

    fn subscribe_filtered<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&AnyMessage) -> bool + Send + Sync + 'static,
        Self: Sized,
    {
        self.dispatcher().subscribe_filtered(filter)
    }

    /// Only payloads of type `T`.
    fn subscribe_to<T: MessageBody>(&self) -> TypedSubscription<T>
    where
        Self: Sized,
    {
        TypedSubscription::new(self.dispatcher())
    }

    /// Wrap `body` in a fresh message and send it; returns the new id.
    async fn send<K>(&self, body: K) -> WireResult<MessageId>
    where
        K: Into<MessageKind> + Send + 'static,
        Self: Sized,
    {
        let message = OrchestrationMessage::new(body);
        let id = message.message_id;
        self.send_message(message.into()).await?;
        Ok(id)
    }

    /// Live view of the clients connected to the server.
    async fn connections(&self) -> StateResult<StateCell<ConnectionDirectory>> {
        let id = directory_state();
        self.states().get(&id).await
    }
}
