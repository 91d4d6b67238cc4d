//! Explicit subscriber lists.
//!
//! A [`Dispatcher`] owns a map from subscriber id to queue. Every subscriber
//! gets an unbounded queue so a slow consumer never stalls the socket reader;
//! dropping a [`Subscription`] removes its entry.

use crate::envelope::AnyMessage;
use futures::Stream;
use orchestra_types::message::{MessageBody, MessageId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

type Filter = Arc<dyn Fn(&AnyMessage) -> bool + Send + Sync>;

struct Subscriber {
    tx: mpsc::UnboundedSender<AnyMessage>,
    filter: Option<Filter>,
}

struct DispatcherInner {
    next_id: AtomicU64,
    /// `None` once the dispatcher is closed.
    subscribers: Mutex<Option<HashMap<u64, Subscriber>>>,
}

/// Fan-out point for inbound messages.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Some(HashMap::new())),
            }),
        }
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.add(None)
    }

    /// Receive only messages matching `filter`.
    pub fn subscribe_filtered<F>(&self, filter: F) -> Subscription
    where
        F: Fn(&AnyMessage) -> bool + Send + Sync + 'static,
    {
        self.add(Some(Arc::new(filter)))
    }

    fn add(&self, filter: Option<Filter>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // On a closed dispatcher `tx` is dropped here and the stream ends at once.
        if let Some(map) = subscribers.as_mut() {
            map.insert(id, Subscriber { tx, filter });
        }
        Subscription {
            id,
            rx,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every matching subscriber, in call order.
    pub(crate) fn publish(&self, message: &AnyMessage) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(map) = subscribers.as_mut() {
            map.retain(|_, sub| {
                if sub.filter.as_ref().is_some_and(|f| !f(message)) {
                    return true;
                }
                sub.tx.send(message.clone()).is_ok()
            });
        }
    }

    /// End every subscription; later subscriptions end immediately.
    pub(crate) fn close(&self) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.take();
    }

    pub fn subscriber_count(&self) -> usize {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.as_ref().map_or(0, |map| map.len())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription; a [`Stream`] of messages in receipt order.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<AnyMessage>,
    dispatcher: Weak<DispatcherInner>,
}

impl Subscription {
    /// Next message, or `None` once the source is closed and drained.
    pub async fn recv(&mut self) -> Option<AnyMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AnyMessage> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = AnyMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            let mut subscribers = inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(map) = subscribers.as_mut() {
                map.remove(&self.id);
            }
        }
    }
}

/// Subscription narrowed to one payload type.
pub struct TypedSubscription<T> {
    inner: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: MessageBody> TypedSubscription<T> {
    pub(crate) fn new(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: dispatcher.subscribe_filtered(|m| m.body::<T>().is_some()),
            _marker: PhantomData,
        }
    }

    /// Next payload of type `T` with the id of its message.
    pub async fn recv(&mut self) -> Option<(MessageId, T)> {
        loop {
            let message = self.inner.recv().await?;
            if let AnyMessage::Known(message) = message {
                if let Some(body) = message.body::<T>() {
                    return Some((message.message_id, body.clone()));
                }
            }
        }
    }
}
