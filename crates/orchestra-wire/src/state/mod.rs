//! Replicated, observable state.
//!
//! A state is identified by a [`StateKey`] (its type name plus an optional
//! instance name) and replicated between peers as JSON bytes. The server side
//! of a connection is authoritative; the dialing side keeps a mirror that it
//! refreshes from pushed values. Updates are compare-and-set against the
//! authority's bytes and retried per [`CasPolicy`] when rejected.

pub(crate) mod engine;
pub(crate) mod frame;
pub mod policy;

pub use policy::CasPolicy;

use crate::error::{StateError, StateResult};
use bytes::Bytes;
use engine::{EngineLink, UpdateOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Wire identity of a state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub type_name: String,
    pub name: Option<String>,
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}#{}", self.type_name, name),
            None => f.write_str(&self.type_name),
        }
    }
}

/// A type that can be held in replicated state.
pub trait StateValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable name used on the wire; both peers must agree on it.
    const TYPE_NAME: &'static str;

    /// Value observed before anyone has set the state.
    fn default_value() -> Self;
}

/// Typed handle naming one state.
pub struct StateId<T> {
    key: StateKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> StateId<T> {
    /// The unnamed instance of `T`.
    pub fn new() -> Self {
        Self::from_key(None)
    }

    /// A named instance of `T`, independent of the unnamed one.
    pub fn named(name: impl Into<String>) -> Self {
        Self::from_key(Some(name.into()))
    }

    fn from_key(name: Option<String>) -> Self {
        Self {
            key: StateKey {
                type_name: T::TYPE_NAME.to_string(),
                name,
            },
            _marker: PhantomData,
        }
    }
}

impl<T> StateId<T> {
    pub fn key(&self) -> &StateKey {
        &self.key
    }
}

impl<T: StateValue> Default for StateId<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for StateId<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for StateId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateId").field(&self.key).finish()
    }
}

pub(crate) fn encode_value<T: StateValue>(value: &T) -> StateResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| StateError::Encode(e.to_string()))
}

pub(crate) fn decode_value<T: StateValue>(raw: &Bytes) -> StateResult<T> {
    if raw.is_empty() {
        return Ok(T::default_value());
    }
    serde_json::from_slice(raw).map_err(|e| StateError::Decode(e.to_string()))
}

/// Live view of one state. Always holds a value; `changed` waits for the next.
pub struct StateCell<T> {
    key: StateKey,
    rx: watch::Receiver<Bytes>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> StateCell<T> {
    pub(crate) fn new(key: StateKey, rx: watch::Receiver<Bytes>) -> Self {
        Self {
            key,
            rx,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Current value; a value that fails to decode reads as the default.
    pub fn value(&self) -> T {
        let raw = self.rx.borrow().clone();
        self.decode_or_default(&raw)
    }

    /// Current value, surfacing decode errors.
    pub fn try_value(&self) -> StateResult<T> {
        let raw = self.rx.borrow().clone();
        decode_value(&raw)
    }

    /// Wait for the next change and return the new value.
    ///
    /// Every accepted update notifies, even one that rewrote identical bytes.
    pub async fn changed(&mut self) -> StateResult<T> {
        self.rx
            .changed()
            .await
            .map_err(|_| StateError::EngineStopped)?;
        Ok(self.mark_seen())
    }

    /// Wait until `predicate` holds for the current value.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> StateResult<T>
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            let value = self.mark_seen();
            if predicate(&value) {
                return Ok(value);
            }
            self.rx
                .changed()
                .await
                .map_err(|_| StateError::EngineStopped)?;
        }
    }

    fn mark_seen(&mut self) -> T {
        let raw = self.rx.borrow_and_update().clone();
        self.decode_or_default(&raw)
    }

    fn decode_or_default(&self, raw: &Bytes) -> T {
        decode_value(raw).unwrap_or_else(|e| {
            warn!(state = %self.key, "orchestra: failed decoding state value: {e}");
            T::default_value()
        })
    }
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            rx: self.rx.clone(),
            _marker: PhantomData,
        }
    }
}

/// Access to the states of one peer (a client's mirror or a server's authority).
#[derive(Clone)]
pub struct StateHandle {
    engine: EngineLink,
    policy: CasPolicy,
}

impl StateHandle {
    pub(crate) fn new(engine: EngineLink, policy: CasPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> &CasPolicy {
        &self.policy
    }

    /// Observe a state. The first call for a key on a mirror asks the
    /// authority for its value; until that arrives the cell reads the default.
    pub async fn get<T: StateValue>(&self, id: &StateId<T>) -> StateResult<StateCell<T>> {
        let rx = self.engine.snapshot(id.key().clone()).await?;
        Ok(StateCell::new(id.key().clone(), rx))
    }

    /// Current value of a state.
    pub async fn value<T: StateValue>(&self, id: &StateId<T>) -> StateResult<T> {
        self.get(id).await?.try_value()
    }

    /// Apply `transform` to the current value and publish the result.
    ///
    /// The transform is re-run against the fresh value whenever the
    /// authority rejects the write because someone else got there first.
    /// Returns the value that was accepted.
    pub async fn update<T, F>(&self, id: &StateId<T>, mut transform: F) -> StateResult<T>
    where
        T: StateValue,
        F: FnMut(T) -> T,
    {
        let key = id.key().clone();
        let rx = self.engine.snapshot(key.clone()).await?;
        let max_attempts = self.policy.attempts();
        let mut attempt = 0u32;
        loop {
            let expected = rx.borrow().clone();
            let current = decode_value::<T>(&expected)?;
            let next = transform(current);
            let updated = encode_value(&next)?;

            match self
                .engine
                .update(key.clone(), expected, updated)
                .await?
            {
                UpdateOutcome::Accepted => return Ok(next),
                UpdateOutcome::Rejected => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        warn!(state = %key, attempts = attempt, "orchestra: state update gave up");
                        return Err(StateError::ContentionExhausted { attempts: attempt });
                    }
                    debug!(state = %key, attempt, "orchestra: state update rejected, retrying");
                    self.engine.refresh(key.clone()).await?;
                    tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
                }
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        self.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter(u32);

    impl StateValue for Counter {
        const TYPE_NAME: &'static str = "test.Counter";

        fn default_value() -> Self {
            Counter(0)
        }
    }

    #[test]
    fn test_state_ids() {
        let unnamed = StateId::<Counter>::new();
        let named = StateId::<Counter>::named("left");
        assert_eq!(unnamed.key().to_string(), "test.Counter");
        assert_eq!(named.key().to_string(), "test.Counter#left");
        assert_ne!(unnamed.key(), named.key());
        assert_eq!(named.clone().key(), named.key());
    }

    #[test]
    fn test_empty_value_is_default() {
        assert_eq!(decode_value::<Counter>(&Bytes::new()).unwrap(), Counter(0));
        let raw = encode_value(&Counter(7)).unwrap();
        assert_eq!(decode_value::<Counter>(&raw).unwrap(), Counter(7));
    }

    #[tokio::test]
    async fn test_cell_falls_back_on_garbage() {
        let (tx, rx) = watch::channel(Bytes::from_static(b"not json"));
        let mut cell = StateCell::<Counter>::new(StateId::<Counter>::new().key().clone(), rx);
        assert_eq!(cell.value(), Counter(0));
        assert!(matches!(cell.try_value(), Err(StateError::Decode(_))));

        tx.send_replace(encode_value(&Counter(4)).unwrap());
        assert_eq!(cell.changed().await.unwrap(), Counter(4));
        assert_eq!(
            cell.wait_for(|c| c.0 == 4).await.unwrap(),
            Counter(4)
        );

        drop(tx);
        assert!(matches!(
            cell.changed().await,
            Err(StateError::EngineStopped)
        ));
    }
}
