//! Frame layer.
//!
//! Every unit on the wire is `[u32 BE payload length][u8 package type][payload]`,
//! so frames can be pipelined back to back on one stream.

use crate::error::{WireError, WireResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix plus package type byte.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Default maximum payload size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// What a frame's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    /// An ordinary, classifier-encoded message.
    Message,
    /// A message serialized by some external scheme; always passed through opaque.
    ExternalMessage,
    Handshake,
    HandshakeAck,
    StateRequest,
    StateUpdate,
    StateUpdateResponse,
    StateValue,
    /// A type byte this build does not know, preserved for forwarding.
    Unknown(u8),
}

impl PackageType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Message,
            2 => Self::ExternalMessage,
            3 => Self::Handshake,
            4 => Self::HandshakeAck,
            5 => Self::StateRequest,
            6 => Self::StateUpdate,
            7 => Self::StateUpdateResponse,
            8 => Self::StateValue,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Message => 1,
            Self::ExternalMessage => 2,
            Self::Handshake => 3,
            Self::HandshakeAck => 4,
            Self::StateRequest => 5,
            Self::StateUpdate => 6,
            Self::StateUpdateResponse => 7,
            Self::StateValue => 8,
            Self::Unknown(byte) => byte,
        }
    }

    /// Whether frames of this type belong to the replicated state protocol.
    pub fn is_state(self) -> bool {
        matches!(
            self,
            Self::StateRequest | Self::StateUpdate | Self::StateUpdateResponse | Self::StateValue
        )
    }
}

/// One length-delimited unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub package_type: PackageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(package_type: PackageType, payload: impl Into<Bytes>) -> Self {
        Self {
            package_type,
            payload: payload.into(),
        }
    }

    /// Encode header and payload into a single buffer.
    pub fn encode_to_bytes(&self) -> WireResult<Bytes> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            WireError::Codec(format!(
                "payload of {} bytes does not fit a u32 length prefix",
                self.payload.len()
            ))
        })?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32(len);
        buf.put_u8(self.package_type.to_byte());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Fails with [`WireError::FrameTooLarge`] if a peer reading with
    /// `max_frame_size` would refuse this frame.
    pub fn check_size(&self, max_frame_size: u32) -> WireResult<()> {
        if self.payload.len() > max_frame_size as usize {
            return Err(WireError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: max_frame_size,
            });
        }
        Ok(())
    }

    /// Total encoded size in bytes.
    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode_to_bytes()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// A clean EOF before the first header byte is reported as
/// [`WireError::ConnectionClosed`]; EOF inside a frame is an I/O error.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> WireResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Err(WireError::ConnectionClosed);
    }
    if first < FRAME_HEADER_SIZE {
        reader.read_exact(&mut header[first..]).await?;
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        package_type: PackageType::from_byte(header[4]),
        payload: Bytes::from(payload),
    })
}
