//! Command implementations.

pub mod client;
pub mod listen;
pub mod serve;

use orchestra_wire::{AnyMessage, MessageRegistry};
use std::sync::OnceLock;

fn registry() -> &'static MessageRegistry {
    static REGISTRY: OnceLock<MessageRegistry> = OnceLock::new();
    REGISTRY.get_or_init(MessageRegistry::with_defaults)
}

/// One-line rendering of a received message: classifier, id, JSON body.
pub fn describe(message: &AnyMessage) -> String {
    match message {
        AnyMessage::Known(message) => {
            let body = registry()
                .encode(&message.kind)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_else(|e| format!("<{e}>"));
            format!("{} {} {}", message.classifier(), message.message_id, body)
        }
        AnyMessage::Opaque(opaque) => format!(
            "opaque {:?} frame ({} bytes)",
            opaque.package_type(),
            opaque.frame.payload.len()
        ),
    }
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::message::{OrchestrationMessage, Ping};
    use orchestra_wire::{Frame, OpaqueMessage, PackageType};

    #[test]
    fn test_describe_known() {
        let message = OrchestrationMessage::new(Ping);
        let line = describe(&message.clone().into());
        assert_eq!(line, format!("core/Ping {} null", message.message_id));
    }

    #[test]
    fn test_describe_opaque() {
        let opaque = OpaqueMessage::new(Frame::new(PackageType::Unknown(42), &b"abc"[..]));
        assert_eq!(
            describe(&opaque.into()),
            "opaque Unknown(42) frame (3 bytes)"
        );
    }
}
