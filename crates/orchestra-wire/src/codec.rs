//! Message codec.
//!
//! An ordinary message frame carries:
//!
//! ```text
//! u16  schema version
//! i32  length + UTF-8 message id
//! i32  length + UTF-8 classifier namespace
//! i32  length + UTF-8 classifier type
//! i32  length + payload (classifier-specific encoding)
//! ```
//!
//! Decoding never fails: anything this peer cannot interpret comes back as
//! an [`OpaqueMessage`] holding the untouched frame, plus one log entry whose
//! text is the [`DecodeFailure`] display string.

use crate::envelope::{AnyMessage, OpaqueMessage};
use crate::error::{WireError, WireResult};
use crate::frame::{Frame, PackageType};
use crate::registry::MessageRegistry;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use orchestra_types::message::{Classifier, MessageId, OrchestrationMessage};
use thiserror::Error;
use tracing::{debug, warn};

/// Message layout revision written by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// A length-prefixed field could not be read.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("negative length prefix {0}")]
    NegativeLength(i32),
    #[error("field needs {needed} bytes but only {available} remain")]
    Truncated { needed: usize, available: usize },
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("invalid id: {0}")]
    InvalidId(#[from] uuid::Error),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("invalid flag byte {0}")]
    InvalidFlag(u8),
    #[error("package type {0:?} is not a state frame")]
    NotStateFrame(PackageType),
}

impl FieldError {
    /// Short error type name recorded in decode diagnostics.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NegativeLength(_) => "NegativeLength",
            Self::Truncated { .. } => "Truncated",
            Self::InvalidUtf8(_) => "InvalidUtf8",
            Self::InvalidId(_) => "InvalidId",
            Self::TrailingBytes(_) => "TrailingBytes",
            Self::InvalidFlag(_) => "InvalidFlag",
            Self::NotStateFrame(_) => "NotStateFrame",
        }
    }
}

/// Writes big-endian, `i32`-length-prefixed fields.
pub(crate) struct FieldWriter {
    buf: BytesMut,
    /// Length of the first field that did not fit an `i32` prefix.
    oversized: Option<usize>,
}

impl FieldWriter {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            oversized: None,
        }
    }

    pub(crate) fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub(crate) fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub(crate) fn put_bytes(&mut self, value: &[u8]) {
        match i32::try_from(value.len()) {
            Ok(len) => {
                self.buf.put_i32(len);
                self.buf.put_slice(value);
            }
            Err(_) => {
                self.oversized.get_or_insert(value.len());
            }
        }
    }

    pub(crate) fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// The encoded fields, or an error if one was too long to prefix.
    pub(crate) fn finish(self) -> WireResult<Bytes> {
        match self.oversized {
            Some(len) => Err(WireError::Codec(format!(
                "field of {len} bytes does not fit an i32 length prefix"
            ))),
            None => Ok(self.buf.freeze()),
        }
    }
}

/// Reads fields written by [`FieldWriter`], never panicking on short input.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> Result<(), FieldError> {
        if self.buf.remaining() < needed {
            return Err(FieldError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8, FieldError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16, FieldError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn get_bytes(&mut self) -> Result<&'a [u8], FieldError> {
        self.need(4)?;
        let len = self.buf.get_i32();
        if len < 0 {
            return Err(FieldError::NegativeLength(len));
        }
        let len = len as usize;
        self.need(len)?;
        let (field, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(field)
    }

    pub(crate) fn get_string(&mut self) -> Result<String, FieldError> {
        Ok(std::str::from_utf8(self.get_bytes()?)?.to_owned())
    }

    /// Fails if any bytes are left over.
    pub(crate) fn finish(self) -> Result<(), FieldError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FieldError::TrailingBytes(self.buf.len()))
        }
    }
}

/// Why a frame decoded as opaque.
///
/// Display strings (the diagnostic log text):
/// - `unexpected package type <type> (not a Message frame)`
/// - `unsupported schema version <n>`
/// - `malformed field: <error type>: <message>`
/// - `no encoder/decoder for classifier '<namespace>/<type>'`
/// - `decoder for '<namespace>/<type>' failed: <error type>: <message>`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("unexpected package type {0:?} (not a Message frame)")]
    UnexpectedPackageType(PackageType),
    #[error("unsupported schema version {0}")]
    UnsupportedSchemaVersion(u16),
    #[error("malformed field: {error_type}: {message}")]
    Malformed {
        error_type: &'static str,
        message: String,
    },
    #[error("no encoder/decoder for classifier '{0}'")]
    UnknownClassifier(Classifier),
    #[error("decoder for '{classifier}' failed: {error_type}: {message}")]
    Decoder {
        classifier: Classifier,
        error_type: &'static str,
        message: String,
    },
}

impl From<FieldError> for DecodeFailure {
    fn from(e: FieldError) -> Self {
        Self::Malformed {
            error_type: e.error_type(),
            message: e.to_string(),
        }
    }
}

fn json_error_type(e: &serde_json::Error) -> &'static str {
    match e.classify() {
        serde_json::error::Category::Io => "serde_json::Io",
        serde_json::error::Category::Syntax => "serde_json::Syntax",
        serde_json::error::Category::Data => "serde_json::Data",
        serde_json::error::Category::Eof => "serde_json::Eof",
    }
}

/// Encode a typed message into a `Message` frame.
pub fn encode_message(
    registry: &MessageRegistry,
    message: &OrchestrationMessage,
) -> WireResult<Frame> {
    let body = registry.encode(&message.kind)?;
    let classifier = message.classifier();

    let mut writer = FieldWriter::new();
    writer.put_u16(SCHEMA_VERSION);
    writer.put_string(&message.message_id.to_string());
    writer.put_string(&classifier.namespace);
    writer.put_string(&classifier.kind);
    writer.put_bytes(&body);
    Ok(Frame::new(PackageType::Message, writer.finish()?))
}

/// Encode any message; opaque messages re-use their original frame.
pub fn encode_any(registry: &MessageRegistry, message: &AnyMessage) -> WireResult<Frame> {
    match message {
        AnyMessage::Known(message) => encode_message(registry, message),
        AnyMessage::Opaque(opaque) => Ok(opaque.frame.clone()),
    }
}

/// Decode a frame, reporting why it could not be interpreted.
pub fn try_decode(
    registry: &MessageRegistry,
    frame: &Frame,
) -> Result<OrchestrationMessage, DecodeFailure> {
    if frame.package_type != PackageType::Message {
        return Err(DecodeFailure::UnexpectedPackageType(frame.package_type));
    }

    let mut reader = FieldReader::new(&frame.payload);
    let version = reader.get_u16()?;
    if version != SCHEMA_VERSION {
        return Err(DecodeFailure::UnsupportedSchemaVersion(version));
    }

    let message_id = MessageId::parse_str(&reader.get_string()?).map_err(FieldError::from)?;
    let namespace = reader.get_string()?;
    let kind = reader.get_string()?;
    let body = reader.get_bytes()?;
    reader.finish()?;

    let classifier = Classifier::owned(namespace, kind);
    match registry.decode(&classifier, body) {
        None => Err(DecodeFailure::UnknownClassifier(classifier)),
        Some(Err(e)) => Err(DecodeFailure::Decoder {
            error_type: json_error_type(&e),
            message: e.to_string(),
            classifier,
        }),
        Some(Ok(kind)) => Ok(OrchestrationMessage::with_id(message_id, kind)),
    }
}

/// Decode a frame into a typed or opaque message. Never fails.
pub fn decode_frame(registry: &MessageRegistry, frame: Frame) -> AnyMessage {
    match try_decode(registry, &frame) {
        Ok(message) => AnyMessage::Known(message),
        Err(failure) => {
            if matches!(failure, DecodeFailure::UnexpectedPackageType(_)) {
                debug!(
                    package_type = ?frame.package_type,
                    len = frame.payload.len(),
                    "orchestra: failed decoding message: {failure}"
                );
            } else {
                warn!(
                    package_type = ?frame.package_type,
                    len = frame.payload.len(),
                    "orchestra: failed decoding message: {failure}"
                );
            }
            AnyMessage::Opaque(OpaqueMessage::new(frame))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::message::*;
    use orchestra_types::ClientRole;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tracing::Level;

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Decode with a scoped subscriber, returning the log lines it emitted.
    fn decode_logged(registry: &MessageRegistry, frame: Frame) -> (AnyMessage, Vec<String>) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(Level::TRACE)
            .with_ansi(false)
            .without_time()
            .finish();
        let decoded =
            tracing::subscriber::with_default(subscriber, || decode_frame(registry, frame));
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        (decoded, text.lines().map(str::to_owned).collect())
    }

    fn catalogue_samples() -> Vec<MessageKind> {
        let request_id = MessageId::new();
        let window = WindowId("main".into());
        vec![
            ReloadRequest {
                changed_files: BTreeMap::from([
                    ("src/app.rs".to_string(), ChangeKind::Modified),
                    ("src/old.rs".to_string(), ChangeKind::Removed),
                ]),
            }
            .into(),
            ReloadResult {
                reload_request_id: request_id,
                is_success: false,
                error_message: Some("boom".into()),
                error_stacktrace: vec!["at main".into()],
            }
            .into(),
            LogMessage {
                tag: "agent".into(),
                level: LogLevel::Info,
                message: "hello".into(),
            }
            .into(),
            BuildStarted.into(),
            BuildFinished.into(),
            BuildTaskResult {
                task_id: ":compile".into(),
                is_success: true,
                started_at_ms: Some(1),
                finished_at_ms: Some(2),
                failures: vec![],
            }
            .into(),
            RecompileRequest.into(),
            RecompileResult {
                recompile_request_id: request_id,
                exit_code: Some(0),
            }
            .into(),
            UiRendered {
                window_id: Some(window.clone()),
                reload_request_id: Some(request_id),
                iteration: 3,
            }
            .into(),
            UiException {
                window_id: None,
                message: Some("layout".into()),
                stacktrace: vec![],
            }
            .into(),
            WindowPositioned {
                window_id: window.clone(),
                x: -10,
                y: 20,
                width: 800,
                height: 600,
                is_always_on_top: true,
            }
            .into(),
            WindowGone { window_id: window }.into(),
            ShutdownRequest {
                reason: Some("done".into()),
            }
            .into(),
            CriticalException {
                client_role: ClientRole::Application,
                message: None,
                exception_class_name: Some("Panic".into()),
                stacktrace: vec!["frame".into()],
            }
            .into(),
            Ping.into(),
            Ack {
                acknowledged_message_id: request_id,
            }
            .into(),
            TestEvent {
                payload: vec![0, 1, 2, 255],
            }
            .into(),
        ]
    }

    fn raw_message_frame(version: u16, id: &str, ns: &str, ty: &str, body: &[u8]) -> Frame {
        let mut writer = FieldWriter::new();
        writer.put_u16(version);
        writer.put_string(id);
        writer.put_string(ns);
        writer.put_string(ty);
        writer.put_bytes(body);
        Frame::new(PackageType::Message, writer.finish().unwrap())
    }

    /// Opaque result carrying the original frame, plus exactly one log line
    /// at `level` with the failure text.
    fn assert_opaque(registry: &MessageRegistry, frame: Frame, level: Level) {
        let failure = try_decode(registry, &frame).unwrap_err();
        let (decoded, lines) = decode_logged(registry, frame.clone());
        match decoded {
            AnyMessage::Opaque(opaque) => assert_eq!(opaque.frame, frame),
            other => panic!("Expected opaque, got {other:?}"),
        }
        assert_eq!(lines.len(), 1, "expected one log line, got {lines:?}");
        let line = lines[0].trim_start();
        assert!(line.starts_with(level.as_str()), "wrong level: {line}");
        let expected = format!("orchestra: failed decoding message: {failure}");
        assert!(line.contains(&expected), "missing {expected:?} in {line}");
    }

    #[test]
    fn test_every_registered_variant_roundtrips() {
        let registry = MessageRegistry::with_defaults();
        let samples = catalogue_samples();
        assert_eq!(samples.len(), registry.len());
        for kind in samples {
            let message = OrchestrationMessage::new(kind);
            let frame = encode_message(&registry, &message).unwrap();
            assert_eq!(frame.package_type, PackageType::Message);
            let (decoded, lines) = decode_logged(&registry, frame);
            assert!(lines.is_empty(), "unexpected logs: {lines:?}");
            assert_eq!(
                decoded,
                AnyMessage::Known(message.clone()),
                "roundtrip failed for {}",
                message.classifier()
            );
        }
    }

    #[test]
    fn test_foreign_package_type_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let frame = Frame::new(PackageType::ExternalMessage, &b"\xac\xed\x00\x05"[..]);
        assert_eq!(
            try_decode(&registry, &frame),
            Err(DecodeFailure::UnexpectedPackageType(
                PackageType::ExternalMessage
            ))
        );
        assert_opaque(&registry, frame, Level::DEBUG);
        assert_opaque(
            &registry,
            Frame::new(PackageType::Unknown(200), Bytes::new()),
            Level::DEBUG,
        );
    }

    #[test]
    fn test_unknown_schema_version_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let id = MessageId::new().to_string();
        let frame = raw_message_frame(7, &id, "core", "Ping", b"null");
        assert_eq!(
            try_decode(&registry, &frame),
            Err(DecodeFailure::UnsupportedSchemaVersion(7))
        );
        assert_eq!(
            try_decode(&registry, &frame).unwrap_err().to_string(),
            "unsupported schema version 7"
        );
        assert_opaque(&registry, frame, Level::WARN);
    }

    #[test]
    fn test_unknown_classifier_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let id = MessageId::new().to_string();
        let frame = raw_message_frame(SCHEMA_VERSION, &id, "future", "Teleport", b"{}");
        let failure = try_decode(&registry, &frame).unwrap_err();
        assert_eq!(
            failure.to_string(),
            "no encoder/decoder for classifier 'future/Teleport'"
        );
        assert_opaque(&registry, frame, Level::WARN);
    }

    #[test]
    fn test_negative_length_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let mut writer = FieldWriter::new();
        writer.put_u16(SCHEMA_VERSION);
        writer.put_u8(0xff);
        writer.put_u8(0xff);
        writer.put_u8(0xff);
        writer.put_u8(0xfe);
        let frame = Frame::new(PackageType::Message, writer.finish().unwrap());

        match try_decode(&registry, &frame) {
            Err(DecodeFailure::Malformed {
                error_type,
                message,
            }) => {
                assert_eq!(error_type, "NegativeLength");
                assert!(message.contains("-2"), "got: {message}");
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
        assert_opaque(&registry, frame, Level::WARN);
    }

    #[test]
    fn test_truncated_payload_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let id = MessageId::new().to_string();
        let full = raw_message_frame(SCHEMA_VERSION, &id, "core", "Ping", b"null");
        for cut in [0, 1, 3, 10, full.payload.len() - 1] {
            let frame = Frame::new(PackageType::Message, full.payload.slice(..cut));
            assert!(matches!(
                try_decode(&registry, &frame),
                Err(DecodeFailure::Malformed { .. })
            ));
            assert_opaque(&registry, frame, Level::WARN);
        }
    }

    #[test]
    fn test_decoder_failure_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let id = MessageId::new().to_string();
        let frame = raw_message_frame(SCHEMA_VERSION, &id, "core", "Ack", b"{\"nope\":1}");
        match try_decode(&registry, &frame) {
            Err(DecodeFailure::Decoder {
                classifier,
                error_type,
                ..
            }) => {
                assert_eq!(classifier, Ack::CLASSIFIER);
                assert_eq!(error_type, "serde_json::Data");
            }
            other => panic!("Expected Decoder failure, got {other:?}"),
        }
        assert_opaque(&registry, frame, Level::WARN);
    }

    #[test]
    fn test_bad_message_id_is_opaque() {
        let registry = MessageRegistry::with_defaults();
        let frame = raw_message_frame(SCHEMA_VERSION, "not-a-uuid", "core", "Ping", b"null");
        assert!(matches!(
            try_decode(&registry, &frame),
            Err(DecodeFailure::Malformed {
                error_type: "InvalidId",
                ..
            })
        ));
        assert_opaque(&registry, frame, Level::WARN);
    }

    #[test]
    fn test_opaque_reencodes_unchanged() {
        let registry = MessageRegistry::with_defaults();
        let mut older = MessageRegistry::with_defaults();
        older.unregister(&CriticalException::CLASSIFIER);

        let message = OrchestrationMessage::new(CriticalException {
            client_role: ClientRole::Compiler,
            message: Some("oom".into()),
            exception_class_name: None,
            stacktrace: vec![],
        });
        let frame = encode_message(&registry, &message).unwrap();

        // An older peer cannot read it but can forward it...
        let forwarded = decode_frame(&older, frame.clone());
        assert!(forwarded.is_opaque());
        let reencoded = encode_any(&older, &forwarded).unwrap();
        assert_eq!(reencoded, frame);

        // ...and a current peer still decodes the forwarded copy.
        assert_eq!(
            decode_frame(&registry, reencoded),
            AnyMessage::Known(message)
        );
    }
}
