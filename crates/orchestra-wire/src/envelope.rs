//! What a subscriber receives: a decoded message or an opaque frame.

use crate::frame::{Frame, PackageType};
use orchestra_types::message::{Classifier, MessageBody, MessageId, OrchestrationMessage};

/// A frame this peer could not interpret.
///
/// Opaque messages are values, not errors: they keep the original frame
/// byte-for-byte so they can be forwarded to a peer that does understand them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueMessage {
    pub frame: Frame,
}

impl OpaqueMessage {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }

    pub fn package_type(&self) -> PackageType {
        self.frame.package_type
    }
}

/// Either a typed message or an opaque one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyMessage {
    Known(OrchestrationMessage),
    Opaque(OpaqueMessage),
}

impl AnyMessage {
    pub fn as_known(&self) -> Option<&OrchestrationMessage> {
        match self {
            Self::Known(message) => Some(message),
            Self::Opaque(_) => None,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.as_known().map(|m| m.message_id)
    }

    pub fn classifier(&self) -> Option<Classifier> {
        self.as_known().map(|m| m.classifier())
    }

    /// Borrow the payload as `T` if this is a decoded message of that type.
    pub fn body<T: MessageBody>(&self) -> Option<&T> {
        self.as_known().and_then(|m| m.body::<T>())
    }
}

impl From<OrchestrationMessage> for AnyMessage {
    fn from(message: OrchestrationMessage) -> Self {
        Self::Known(message)
    }
}

impl From<OpaqueMessage> for AnyMessage {
    fn from(message: OpaqueMessage) -> Self {
        Self::Opaque(message)
    }
}
