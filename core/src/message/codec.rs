//! Framed wire protocol — JSON envelopes with a `type` discriminator.
//!
//! Every frame is a JSON object whose `type` field names the variant; bodies
//! are UTF-8 strings and integer-millisecond timestamps. Binary payloads
//! (ciphertext) travel hex-encoded. Unknown frame types decode to
//! `Frame::Unknown` so newer peers never break older cores.

use crate::clock::VectorClock;
use crate::message::types::{ContentType, Message, MessageStatus, now_ms};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire protocol version, pinned at handshake. A mismatch rejects the
/// connection.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size: 256 KB.
/// Prevents memory exhaustion from malicious oversized frames.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Frame types this codec can produce and fully parse
const KNOWN_FRAME_TYPES: &[&str] = &[
    "chat",
    "ack",
    "read_receipt_batch",
    "status_update",
    "reaction_event",
    "sync_request",
    "sync_response",
    "ping",
    "pong",
    "handshake",
    "handshake_response",
    "disconnect",
];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown frame type: {0}")]
    UnknownType(String),
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Relay acknowledgment status for a previously sent frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Delivered,
    Failed,
    Expired,
    Rejected,
}

/// Receipt kind inside a `read_receipt_batch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl From<ReceiptStatus> for MessageStatus {
    fn from(r: ReceiptStatus) -> Self {
        match r {
            ReceiptStatus::Delivered => MessageStatus::Delivered,
            ReceiptStatus::Read => MessageStatus::Read,
        }
    }
}

/// One entry of a batched receipt frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEntry {
    pub message_id: String,
    pub status: ReceiptStatus,
    pub at: u64,
}

/// Reaction operation carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionOp {
    Add,
    Remove,
}

/// A message as it travels inside `chat` and `sync_response` frames.
/// Ciphertext is hex so the envelope stays printable JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub session_id: String,
    pub sender: String,
    pub recipient: String,
    pub content_type: ContentType,
    pub ciphertext: String,
    pub vector_clock: VectorClock,
    pub created_at: u64,
}

impl WireMessage {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            sender: msg.sender.clone(),
            recipient: msg.recipient.clone(),
            content_type: msg.content_type,
            ciphertext: hex::encode(&msg.ciphertext),
            vector_clock: msg.vector_clock.clone(),
            created_at: msg.created_at,
        }
    }

    /// Rehydrate into a stored message with the given initial status
    pub fn into_message(self, status: MessageStatus) -> Result<Message, ProtocolError> {
        let ciphertext = hex::decode(&self.ciphertext)
            .map_err(|e| ProtocolError::MalformedFrame(format!("bad ciphertext hex: {}", e)))?;
        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            sender: self.sender,
            recipient: self.recipient,
            content_type: self.content_type,
            ciphertext,
            created_at: self.created_at,
            vector_clock: self.vector_clock,
            status,
            attempts: 0,
        })
    }
}

/// The wire frame. Encoded as `{"type": "...", ...body}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Chat {
        #[serde(flatten)]
        message: WireMessage,
        #[serde(skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },
    Ack {
        ref_id: String,
        status: AckStatus,
    },
    ReadReceiptBatch {
        session_id: String,
        reader: String,
        receipts: Vec<ReceiptEntry>,
    },
    StatusUpdate {
        message_id: String,
        status: MessageStatus,
        at: u64,
    },
    ReactionEvent {
        message_id: String,
        session_id: String,
        reactor: String,
        emoji: String,
        op: ReactionOp,
        at: u64,
    },
    SyncRequest {
        session_id: String,
        since_vc: VectorClock,
    },
    SyncResponse {
        session_id: String,
        messages: Vec<WireMessage>,
        server_vc: VectorClock,
    },
    Ping {
        id: String,
        sent_at: u64,
    },
    Pong {
        id: String,
        sent_at: u64,
    },
    /// First client-to-server frame. Signature is opaque to the core;
    /// only `version` is checked.
    Handshake {
        identity: String,
        ts: u64,
        signature: String,
        version: u32,
    },
    HandshakeResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        ts: u64,
    },
    Disconnect {
        reason: String,
    },
    /// Catch-all for forward compatibility — never encoded, only decoded
    Unknown {
        frame_type: String,
        raw: serde_json::Value,
    },
}

impl Frame {
    /// Human-readable frame type, matching the wire discriminator
    pub fn frame_type(&self) -> &str {
        match self {
            Frame::Chat { .. } => "chat",
            Frame::Ack { .. } => "ack",
            Frame::ReadReceiptBatch { .. } => "read_receipt_batch",
            Frame::StatusUpdate { .. } => "status_update",
            Frame::ReactionEvent { .. } => "reaction_event",
            Frame::SyncRequest { .. } => "sync_request",
            Frame::SyncResponse { .. } => "sync_response",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Handshake { .. } => "handshake",
            Frame::HandshakeResponse { .. } => "handshake_response",
            Frame::Disconnect { .. } => "disconnect",
            Frame::Unknown { frame_type, .. } => frame_type,
        }
    }

    /// Build a handshake frame for this identity at the pinned version
    pub fn handshake(identity: String, signature: String) -> Self {
        Frame::Handshake {
            identity,
            ts: now_ms(),
            signature,
            version: PROTOCOL_VERSION,
        }
    }

    /// Check a peer handshake's version against ours
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if let Frame::Handshake { version, .. } = self {
            if *version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: *version,
                });
            }
        }
        Ok(())
    }
}

/// Serialize a frame to wire bytes (JSON)
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    if let Frame::Unknown { frame_type, .. } = frame {
        return Err(ProtocolError::UnknownType(frame_type.clone()));
    }

    let bytes =
        serde_json::to_vec(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Deserialize wire bytes into a frame.
///
/// A well-formed JSON object with an unrecognized `type` becomes
/// `Frame::Unknown`; a recognized `type` with a broken body is an error.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(bytes.len()));
    }

    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;

    let frame_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::MalformedFrame("missing type discriminator".to_string()))?
        .to_string();

    if !KNOWN_FRAME_TYPES.contains(&frame_type.as_str()) {
        return Ok(Frame::Unknown {
            frame_type,
            raw: value,
        });
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::Session;

    fn sample_message() -> Message {
        let session = Session {
            session_id: "s1".into(),
            peer_identity: "peer".into(),
            local_device_id: "dev1".into(),
            created_at: now_ms(),
        };
        Message::outbound(
            &session,
            "me".into(),
            ContentType::Text,
            vec![0xde, 0xad, 0xbe, 0xef],
            VectorClock::new().incremented("dev1"),
        )
    }

    #[test]
    fn test_chat_frame_roundtrip() {
        let msg = sample_message();
        let frame = Frame::Chat {
            message: WireMessage::from_message(&msg),
            ttl: None,
        };

        let bytes = encode_frame(&frame).unwrap();
        let restored = decode_frame(&bytes).unwrap();

        match restored {
            Frame::Chat { message, ttl } => {
                assert_eq!(message.id, msg.id);
                assert_eq!(message.ciphertext, "deadbeef");
                assert!(ttl.is_none());
                let back = message.into_message(MessageStatus::Delivered).unwrap();
                assert_eq!(back.ciphertext, msg.ciphertext);
            }
            other => panic!("wrong frame type: {}", other.frame_type()),
        }
    }

    #[test]
    fn test_type_discriminator_on_the_wire() {
        let frame = Frame::Ping {
            id: "p1".into(),
            sent_at: 12345,
        };
        let bytes = encode_frame(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["sent_at"], 12345);
    }

    #[test]
    fn test_unknown_frame_type_is_tolerated() {
        let bytes = br#"{"type":"hologram","payload":[1,2,3]}"#;
        let frame = decode_frame(bytes).unwrap();
        match frame {
            Frame::Unknown { frame_type, raw } => {
                assert_eq!(frame_type, "hologram");
                assert_eq!(raw["payload"][0], 1);
            }
            other => panic!("expected Unknown, got {}", other.frame_type()),
        }
    }

    #[test]
    fn test_unknown_frame_cannot_be_encoded() {
        let frame = Frame::Unknown {
            frame_type: "hologram".into(),
            raw: serde_json::json!({}),
        };
        assert!(matches!(
            encode_frame(&frame),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn test_known_type_with_broken_body_is_malformed() {
        let bytes = br#"{"type":"ack","ref_id":42}"#;
        assert!(matches!(
            decode_frame(bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_missing_discriminator_is_malformed() {
        let bytes = br#"{"ref_id":"m1"}"#;
        assert!(matches!(
            decode_frame(bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_both_ways() {
        let msg = Message {
            ciphertext: vec![0u8; MAX_FRAME_SIZE],
            ..sample_message()
        };
        let frame = Frame::Chat {
            message: WireMessage::from_message(&msg),
            ttl: None,
        };
        assert!(matches!(
            encode_frame(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));

        let big = vec![b' '; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            decode_frame(&big),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_handshake_version_check() {
        let ok = Frame::handshake("wallet".into(), "sig".into());
        assert!(ok.check_version().is_ok());

        let stale = Frame::Handshake {
            identity: "wallet".into(),
            ts: 0,
            signature: "sig".into(),
            version: 0,
        };
        assert!(matches!(
            stale.check_version(),
            Err(ProtocolError::VersionMismatch { ours: 1, theirs: 0 })
        ));
    }

    #[test]
    fn test_receipt_batch_roundtrip() {
        let frame = Frame::ReadReceiptBatch {
            session_id: "s1".into(),
            reader: "walletB".into(),
            receipts: vec![
                ReceiptEntry {
                    message_id: "m1".into(),
                    status: ReceiptStatus::Read,
                    at: 100,
                },
                ReceiptEntry {
                    message_id: "m2".into(),
                    status: ReceiptStatus::Delivered,
                    at: 101,
                },
            ],
        };

        let bytes = encode_frame(&frame).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::ReadReceiptBatch { receipts, .. } => {
                assert_eq!(receipts.len(), 2);
                assert_eq!(receipts[0].status, ReceiptStatus::Read);
                assert_eq!(MessageStatus::from(receipts[1].status), MessageStatus::Delivered);
            }
            other => panic!("wrong frame type: {}", other.frame_type()),
        }
    }

    #[test]
    fn test_sync_frames_roundtrip() {
        let req = Frame::SyncRequest {
            session_id: "s1".into(),
            since_vc: VectorClock::new().incremented("dev1"),
        };
        let bytes = encode_frame(&req).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::SyncRequest { since_vc, .. } => assert_eq!(since_vc.get("dev1"), 1),
            other => panic!("wrong frame type: {}", other.frame_type()),
        }

        let resp = Frame::SyncResponse {
            session_id: "s1".into(),
            messages: vec![WireMessage::from_message(&sample_message())],
            server_vc: VectorClock::new(),
        };
        let bytes = encode_frame(&resp).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::SyncResponse { messages, .. } => assert_eq!(messages.len(), 1),
            other => panic!("wrong frame type: {}", other.frame_type()),
        }
    }
}
