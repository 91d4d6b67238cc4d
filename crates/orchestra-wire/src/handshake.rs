//! Role handshake exchanged before any application traffic.
//!
//! The dialing side sends a `Handshake` frame carrying its [`ClientIdentity`];
//! the accepting side answers with a `HandshakeAck` carrying its
//! [`ServerIdentity`]. Both payloads are JSON.

use crate::error::{WireError, WireResult};
use crate::frame::{read_frame, write_frame, Frame, PackageType};
use orchestra_types::{ClientIdentity, ProtocolVersion, ServerIdentity};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Dialer side: announce ourselves and wait for the acknowledgement.
pub(crate) async fn dial<R, W>(
    reader: &mut R,
    writer: &mut W,
    identity: &ClientIdentity,
    max_frame_size: u32,
) -> WireResult<ServerIdentity>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = Frame::new(PackageType::Handshake, serde_json::to_vec(identity)?);
    write_frame(writer, &hello).await?;

    let reply = read_frame(reader, max_frame_size).await?;
    if reply.package_type != PackageType::HandshakeAck {
        return Err(WireError::HandshakeFailed(format!(
            "expected HandshakeAck, got {:?}",
            reply.package_type
        )));
    }
    let server: ServerIdentity = serde_json::from_slice(&reply.payload)
        .map_err(|e| WireError::HandshakeFailed(format!("invalid HandshakeAck: {e}")))?;
    log_version_skew(server.protocol_version);
    Ok(server)
}

/// Accepting side: read the peer's identity and acknowledge it.
pub(crate) async fn accept<R, W>(
    reader: &mut R,
    writer: &mut W,
    max_frame_size: u32,
) -> WireResult<ClientIdentity>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = read_frame(reader, max_frame_size).await?;
    if hello.package_type != PackageType::Handshake {
        return Err(WireError::HandshakeFailed(format!(
            "expected Handshake, got {:?}",
            hello.package_type
        )));
    }
    let client: ClientIdentity = serde_json::from_slice(&hello.payload)
        .map_err(|e| WireError::HandshakeFailed(format!("invalid Handshake: {e}")))?;
    log_version_skew(client.protocol_version);

    let ack = Frame::new(
        PackageType::HandshakeAck,
        serde_json::to_vec(&ServerIdentity::current())?,
    );
    write_frame(writer, &ack).await?;
    Ok(client)
}

fn log_version_skew(remote: ProtocolVersion) {
    if remote != ProtocolVersion::CURRENT {
        debug!(
            local = %ProtocolVersion::CURRENT,
            %remote,
            "orchestra: peer speaks a different protocol revision"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_FRAME_SIZE;
    use orchestra_types::ClientRole;

    #[tokio::test]
    async fn test_handshake_exchange() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client_io);
        let (mut server_read, mut server_write) = tokio::io::split(server_io);
        let identity = ClientIdentity::current(ClientRole::Tooling);

        let (dialed, accepted) = tokio::join!(
            dial(&mut client_read, &mut client_write, &identity, MAX_FRAME_SIZE),
            accept(&mut server_read, &mut server_write, MAX_FRAME_SIZE),
        );
        assert_eq!(dialed.unwrap(), ServerIdentity::current());
        assert_eq!(accepted.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_accept_rejects_non_handshake() {
        let (mut client_io, server_io) = tokio::io::duplex(1024);
        let (mut server_read, mut server_write) = tokio::io::split(server_io);
        write_frame(
            &mut client_io,
            &Frame::new(PackageType::Message, &b"hello"[..]),
        )
        .await
        .unwrap();

        match accept(&mut server_read, &mut server_write, MAX_FRAME_SIZE).await {
            Err(WireError::HandshakeFailed(msg)) => assert!(msg.contains("Message"), "{msg}"),
            other => panic!("Expected HandshakeFailed, got {other:?}"),
        }
    }
}
