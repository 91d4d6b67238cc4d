//! State protocol frames.
//!
//! ```text
//! key      = i32 len + type name, u8 has_name, [i32 len + name]
//! Request  = key
//! Update   = i32 len + update id, key, i32 len + expected, i32 len + updated
//! Response = i32 len + update id, u8 accepted
//! Value    = key, i32 len + value
//! ```
//!
//! Values are opaque bytes; an empty value means "never set".

use super::StateKey;
use crate::codec::{FieldError, FieldReader, FieldWriter};
use crate::error::WireResult;
use crate::frame::{Frame, PackageType};
use bytes::Bytes;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateFrame {
    /// Ask the authority for the current value (and subscribe to pushes).
    Request { key: StateKey },
    /// Compare-and-set against the authority's value.
    Update {
        update_id: Uuid,
        key: StateKey,
        expected: Bytes,
        updated: Bytes,
    },
    UpdateResponse { update_id: Uuid, accepted: bool },
    /// Current value, sent in answer to a request or pushed after a change.
    Value { key: StateKey, value: Bytes },
}

impl StateFrame {
    pub(crate) fn package_type(&self) -> PackageType {
        match self {
            Self::Request { .. } => PackageType::StateRequest,
            Self::Update { .. } => PackageType::StateUpdate,
            Self::UpdateResponse { .. } => PackageType::StateUpdateResponse,
            Self::Value { .. } => PackageType::StateValue,
        }
    }

    pub(crate) fn encode(&self) -> WireResult<Frame> {
        let mut w = FieldWriter::new();
        match self {
            Self::Request { key } => put_key(&mut w, key),
            Self::Update {
                update_id,
                key,
                expected,
                updated,
            } => {
                w.put_string(&update_id.to_string());
                put_key(&mut w, key);
                w.put_bytes(expected);
                w.put_bytes(updated);
            }
            Self::UpdateResponse {
                update_id,
                accepted,
            } => {
                w.put_string(&update_id.to_string());
                w.put_u8(u8::from(*accepted));
            }
            Self::Value { key, value } => {
                put_key(&mut w, key);
                w.put_bytes(value);
            }
        }
        Ok(Frame::new(self.package_type(), w.finish()?))
    }

    pub(crate) fn decode(frame: &Frame) -> Result<Self, FieldError> {
        let mut r = FieldReader::new(&frame.payload);
        let decoded = match frame.package_type {
            PackageType::StateRequest => Self::Request {
                key: get_key(&mut r)?,
            },
            PackageType::StateUpdate => Self::Update {
                update_id: Uuid::parse_str(&r.get_string()?)?,
                key: get_key(&mut r)?,
                expected: Bytes::copy_from_slice(r.get_bytes()?),
                updated: Bytes::copy_from_slice(r.get_bytes()?),
            },
            PackageType::StateUpdateResponse => Self::UpdateResponse {
                update_id: Uuid::parse_str(&r.get_string()?)?,
                accepted: get_flag(&mut r)?,
            },
            PackageType::StateValue => Self::Value {
                key: get_key(&mut r)?,
                value: Bytes::copy_from_slice(r.get_bytes()?),
            },
            other => return Err(FieldError::NotStateFrame(other)),
        };
        r.finish()?;
        Ok(decoded)
    }
}

fn put_key(w: &mut FieldWriter, key: &StateKey) {
    w.put_string(&key.type_name);
    match &key.name {
        Some(name) => {
            w.put_u8(1);
            w.put_string(name);
        }
        None => w.put_u8(0),
    }
}

fn get_key(r: &mut FieldReader<'_>) -> Result<StateKey, FieldError> {
    let type_name = r.get_string()?;
    let name = if get_flag(r)? {
        Some(r.get_string()?)
    } else {
        None
    };
    Ok(StateKey { type_name, name })
}

fn get_flag(r: &mut FieldReader<'_>) -> Result<bool, FieldError> {
    match r.get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(FieldError::InvalidFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: Option<&str>) -> StateKey {
        StateKey {
            type_name: "test.Counter".into(),
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_frames_roundtrip() {
        let frames = [
            StateFrame::Request { key: key(None) },
            StateFrame::Update {
                update_id: Uuid::new_v4(),
                key: key(Some("left")),
                expected: Bytes::new(),
                updated: Bytes::from_static(b"1"),
            },
            StateFrame::UpdateResponse {
                update_id: Uuid::new_v4(),
                accepted: true,
            },
            StateFrame::Value {
                key: key(Some("")),
                value: Bytes::from_static(b"{\"n\":3}"),
            },
        ];
        for frame in frames {
            let encoded = frame.encode().unwrap();
            assert!(encoded.package_type.is_state());
            assert_eq!(StateFrame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_named_and_unnamed_keys_differ() {
        let unnamed = StateFrame::Request { key: key(None) }.encode().unwrap();
        let empty_name = StateFrame::Request { key: key(Some("")) }.encode().unwrap();
        assert_ne!(unnamed.payload, empty_name.payload);
    }

    #[test]
    fn test_rejects_bad_flag() {
        let mut frame = StateFrame::UpdateResponse {
            update_id: Uuid::new_v4(),
            accepted: false,
        }
        .encode()
        .unwrap();
        let mut payload = frame.payload.to_vec();
        if let Some(last) = payload.last_mut() {
            *last = 7;
        }
        frame.payload = payload.into();
        assert!(matches!(
            StateFrame::decode(&frame),
            Err(FieldError::InvalidFlag(7))
        ));
    }

    #[test]
    fn test_rejects_non_state_frame() {
        let frame = Frame::new(PackageType::Message, Bytes::new());
        assert!(matches!(
            StateFrame::decode(&frame),
            Err(FieldError::NotStateFrame(PackageType::Message))
        ));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let frame = StateFrame::Request { key: key(None) }.encode().unwrap();
        let mut payload = frame.payload.to_vec();
        payload.push(0);
        let padded = Frame::new(frame.package_type, payload);
        assert!(matches!(
            StateFrame::decode(&padded),
            Err(FieldError::TrailingBytes(1))
        ));
    }
}
