//! Classifier registry: maps wire classifiers to payload encoders and decoders.
//!
//! The registry is a plain lookup table: no reflection, no type names on the
//! wire. A classifier that is not in the table decodes to an opaque message.

use crate::error::{WireError, WireResult};
use orchestra_types::message::*;
use std::collections::HashMap;

type EncodeFn = fn(&MessageKind) -> WireResult<Vec<u8>>;
type DecodeFn = fn(&[u8]) -> Result<MessageKind, serde_json::Error>;

/// Encoder/decoder pair for one classifier.
#[derive(Clone, Copy)]
struct MessageCodec {
    encode: EncodeFn,
    decode: DecodeFn,
    available_since: ProtocolVersion,
}

fn encode_body<T: MessageBody>(kind: &MessageKind) -> WireResult<Vec<u8>> {
    let body = T::from_kind(kind).ok_or_else(|| {
        WireError::Codec(format!(
            "codec for '{}' received a '{}' payload",
            T::CLASSIFIER,
            kind.classifier()
        ))
    })?;
    Ok(serde_json::to_vec(body)?)
}

fn decode_body<T: MessageBody>(bytes: &[u8]) -> Result<MessageKind, serde_json::Error> {
    serde_json::from_slice::<T>(bytes).map(Into::into)
}

/// Table of every message type this peer can encode and decode.
#[derive(Clone)]
pub struct MessageRegistry {
    codecs: HashMap<Classifier, MessageCodec>,
}

impl MessageRegistry {
    /// An empty registry: every message decodes as opaque.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry containing the full built-in catalogue.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .register::<ReloadRequest>()
            .register::<ReloadResult>()
            .register::<LogMessage>()
            .register::<BuildStarted>()
            .register::<BuildFinished>()
            .register::<BuildTaskResult>()
            .register::<RecompileRequest>()
            .register::<RecompileResult>()
            .register::<UiRendered>()
            .register::<UiException>()
            .register::<WindowPositioned>()
            .register::<WindowGone>()
            .register::<ShutdownRequest>()
            .register::<CriticalException>()
            .register::<Ping>()
            .register::<Ack>()
            .register::<TestEvent>();
        registry
    }

    /// Add (or replace) the codec for `T`.
    pub fn register<T: MessageBody>(&mut self) -> &mut Self {
        self.codecs.insert(
            T::CLASSIFIER,
            MessageCodec {
                encode: encode_body::<T>,
                decode: decode_body::<T>,
                available_since: T::AVAILABLE_SINCE,
            },
        );
        self
    }

    /// Remove a classifier, e.g. to emulate an older peer.
    pub fn unregister(&mut self, classifier: &Classifier) -> &mut Self {
        self.codecs.remove(classifier);
        self
    }

    pub fn contains(&self, classifier: &Classifier) -> bool {
        self.codecs.contains_key(classifier)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Protocol revision a registered classifier first appeared in.
    pub fn available_since(&self, classifier: &Classifier) -> Option<ProtocolVersion> {
        self.codecs.get(classifier).map(|c| c.available_since)
    }

    /// Encode a payload body with its classifier's encoder.
    pub fn encode(&self, kind: &MessageKind) -> WireResult<Vec<u8>> {
        let classifier = kind.classifier();
        let codec = self
            .codecs
            .get(&classifier)
            .ok_or_else(|| WireError::UnknownClassifier(classifier.to_string()))?;
        (codec.encode)(kind)
    }

    /// Decode a payload body; `None` when the classifier is not registered.
    pub fn decode(
        &self,
        classifier: &Classifier,
        bytes: &[u8],
    ) -> Option<Result<MessageKind, serde_json::Error>> {
        self.codecs.get(classifier).map(|codec| (codec.decode)(bytes))
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut classifiers: Vec<String> = self.codecs.keys().map(|c| c.to_string()).collect();
        classifiers.sort();
        f.debug_struct("MessageRegistry")
            .field("classifiers", &classifiers)
            .finish()
    }
}
