//! Control packets exchanged before the session key is established.
//!
//! Each packet is a UTF-8 JSON object with a `type` discriminant, written to
//! the stream as-is with no length prefix or delimiter. The protocol relies
//! on each write arriving as one read. TCP does not promise that, so a
//! received frame is parsed as a stream of JSON documents: coalesced packets
//! are split apart and whatever follows the last packet is handed back to
//! the caller. A packet split across two reads is still not recovered.

use serde::{Deserialize, Serialize};
use serde_json::de::SliceRead;
use serde_json::{Deserializer, StreamDeserializer};

use crate::chat::error::ChatError;

/// A handshake control packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlPacket {
    /// Ask the peer for its public key.
    KeyRequest,

    /// Own public key as PEM.
    Key { key: String },

    /// Identity challenge: `encrypt` is `value` encrypted to the peer's public key.
    VerifyKey { encrypt: String, value: String },

    /// Whether the challenge decrypted to the expected value.
    VerifyAnswer { ans: bool },

    /// The sender has the keys it needs.
    KeysReady,

    /// A session key segment encrypted to the receiver's public key.
    SessionSegment { key: String },

    /// `encrypt` is `value` under the completed session key.
    SessionTest { value: String, encrypt: String },

    /// Whether the session test decrypted correctly.
    SessionResponse { value: bool },
}

impl ControlPacket {
    /// The wire name of this packet's `type`.
    pub fn name(&self) -> &'static str {
        match self {
            ControlPacket::KeyRequest => "keyRequest",
            ControlPacket::Key { .. } => "key",
            ControlPacket::VerifyKey { .. } => "verifyKey",
            ControlPacket::VerifyAnswer { .. } => "verifyAnswer",
            ControlPacket::KeysReady => "keysReady",
            ControlPacket::SessionSegment { .. } => "sessionSegment",
            ControlPacket::SessionTest { .. } => "sessionTest",
            ControlPacket::SessionResponse { .. } => "sessionResponse",
        }
    }

    /// Serialize to compact JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChatError> {
        serde_json::to_vec(self).map_err(|e| ChatError::Protocol(e.to_string()))
    }

    /// Parse exactly one packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChatError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ChatError::Protocol(format!("invalid control packet: {}", e)))
    }
}

/// Iterator over the control packets contained in one received frame.
pub struct PacketStream<'a> {
    frame: &'a [u8],
    inner: StreamDeserializer<'a, SliceRead<'a>, ControlPacket>,
    failed: bool,
}

impl<'a> PacketStream<'a> {
    /// Start parsing a frame.
    pub fn new(frame: &'a [u8]) -> Self {
        Self {
            frame,
            inner: Deserializer::from_slice(frame).into_iter(),
            failed: false,
        }
    }

    /// Bytes after the last packet yielded so far, without leading whitespace.
    pub fn remainder(&self) -> &'a [u8] {
        let rest = &self.frame[self.inner.byte_offset()..];
        let start = rest
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(rest.len());
        &rest[start..]
    }
}

impl Iterator for PacketStream<'_> {
    type Item = Result<ControlPacket, ChatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next()? {
            Ok(packet) => Some(Ok(packet)),
            Err(e) => {
                self.failed = true;
                Some(Err(ChatError::Protocol(format!("invalid control packet: {}", e))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        let cases = [
            (ControlPacket::KeyRequest, r#"{"type":"keyRequest"}"#),
            (ControlPacket::KeysReady, r#"{"type":"keysReady"}"#),
            (
                ControlPacket::Key { key: "PEM".into() },
                r#"{"type":"key","key":"PEM"}"#,
            ),
            (
                ControlPacket::VerifyKey { encrypt: "c".into(), value: "v".into() },
                r#"{"type":"verifyKey","encrypt":"c","value":"v"}"#,
            ),
            (ControlPacket::VerifyAnswer { ans: true }, r#"{"type":"verifyAnswer","ans":true}"#),
            (
                ControlPacket::SessionSegment { key: "k".into() },
                r#"{"type":"sessionSegment","key":"k"}"#,
            ),
            (
                ControlPacket::SessionTest { value: "v".into(), encrypt: "e".into() },
                r#"{"type":"sessionTest","value":"v","encrypt":"e"}"#,
            ),
            (
                ControlPacket::SessionResponse { value: false },
                r#"{"type":"sessionResponse","value":false}"#,
            ),
        ];

        for (packet, json) in cases {
            assert_eq!(String::from_utf8(packet.to_bytes().unwrap()).unwrap(), json);
            assert_eq!(ControlPacket::from_bytes(json.as_bytes()).unwrap(), packet);
            assert_eq!(packet.name(), serde_json::from_str::<serde_json::Value>(json).unwrap()["type"]);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ControlPacket::from_bytes(br#"{"type":"hello"}"#).is_err());
        assert!(ControlPacket::from_bytes(br#"{"key":"no type"}"#).is_err());
        assert!(ControlPacket::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_packet_never_contains_newline() {
        let packet = ControlPacket::Key { key: "line one\nline two\n".into() };
        assert!(!packet.to_bytes().unwrap().contains(&b'\n'));
    }

    #[test]
    fn test_stream_splits_coalesced_packets() {
        let frame = br#"{"type":"keysReady"}{"type":"verifyAnswer","ans":false}"#;
        let packets: Vec<_> = PacketStream::new(frame).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            packets,
            vec![ControlPacket::KeysReady, ControlPacket::VerifyAnswer { ans: false }]
        );
    }

    #[test]
    fn test_stream_remainder_after_packet() {
        let frame = br#"{"type":"sessionResponse","value":true}0a1b2c"#;
        let mut stream = PacketStream::new(frame);
        assert_eq!(
            stream.next().unwrap().unwrap(),
            ControlPacket::SessionResponse { value: true }
        );
        assert_eq!(stream.remainder(), b"0a1b2c");
    }

    #[test]
    fn test_stream_stops_after_error() {
        let mut stream = PacketStream::new(b"{broken");
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_empty_remainder() {
        let frame = br#"{"type":"keyRequest"}  "#;
        let mut stream = PacketStream::new(frame);
        stream.next().unwrap().unwrap();
        assert!(stream.remainder().is_empty());
    }
}
