// Core message and session types — everything else in the crate moves these

use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};

/// Wall-clock milliseconds since the Unix epoch. Informational only; ordering
/// decisions use vector clocks.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What kind of payload a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Encrypted user text
    Text,
    /// Emoji reaction payload
    Reaction,
    /// System notice (session lifecycle, etc.)
    System,
}

/// Delivery status of a message.
///
/// Transitions are monotone along `Queued < Sent < Delivered < Read`;
/// `Failed` is terminal and reachable only from `Queued` or `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Persisted locally, not yet accepted by a relay
    Queued,
    /// Relay accepted the frame
    Sent,
    /// Peer device acknowledged receipt
    Delivered,
    /// Peer read the message
    Read,
    /// Retries exhausted
    Failed,
}

impl MessageStatus {
    /// Position along the monotone status order
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    /// Same-status is not a transition (callers treat it as a no-op).
    pub fn can_transition(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Failed, _) | (Read, _) => false,
            (from, Failed) => matches!(from, Queued | Sent),
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outbound queue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Key-encoding rank: lower sorts first, so High drains first
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// A conversation between two identities.
///
/// The 32-byte shared key is *not* part of this record — it lives in the
/// cipher's key ring and never crosses the store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Deterministic id, equal on both sides
    pub session_id: String,
    /// Peer's opaque identity string (wallet address)
    pub peer_identity: String,
    /// This install's stable device id
    pub local_device_id: String,
    /// Creation time (ms)
    pub created_at: u64,
}

/// Derive the stable session id from the identity pair plus a creation epoch.
///
/// The pair is sorted first so both sides derive the same id regardless of
/// who opened the conversation.
pub fn derive_session_id(identity_a: &str, identity_b: &str, epoch: u64) -> String {
    let (lo, hi) = if identity_a <= identity_b {
        (identity_a, identity_b)
    } else {
        (identity_b, identity_a)
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(lo.as_bytes());
    hasher.update(b"\0");
    hasher.update(hi.as_bytes());
    hasher.update(b"\0");
    hasher.update(&epoch.to_le_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Globally unique message id: `msg_{device}_{timestamp_ms}_{rand}`
pub fn new_message_id(device: &str) -> String {
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}_{}", device, now_ms(), &rand[..8])
}

/// An atomic, immutable exchange unit. Only `status` and `attempts` mutate
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender: String,
    pub recipient: String,
    pub content_type: ContentType,
    /// Encrypted payload — the store never sees plaintext
    pub ciphertext: Vec<u8>,
    /// Wall-clock creation time (ms), informational only
    pub created_at: u64,
    pub vector_clock: VectorClock,
    pub status: MessageStatus,
    pub attempts: u32,
}

impl Message {
    /// Create a locally originated message in `Queued`
    pub fn outbound(
        session: &Session,
        sender: String,
        content_type: ContentType,
        ciphertext: Vec<u8>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: new_message_id(&session.local_device_id),
            session_id: session.session_id.clone(),
            sender,
            recipient: session.peer_identity.clone(),
            content_type,
            ciphertext,
            created_at: now_ms(),
            vector_clock,
            status: MessageStatus::Queued,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_order_independent() {
        let a = derive_session_id("walletA", "walletB", 7);
        let b = derive_session_id("walletB", "walletA", 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_session_id_changes_with_epoch() {
        let a = derive_session_id("walletA", "walletB", 1);
        let b = derive_session_id("walletA", "walletB", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_id_format() {
        let id = new_message_id("device1");
        let parts: Vec<&str> = id.splitn(4, '_').collect();
        assert_eq!(parts[0], "msg");
        assert_eq!(parts[1], "device1");
        assert!(parts[2].parse::<u64>().is_ok());
        assert_eq!(parts[3].len(), 8);
    }

    #[test]
    fn test_status_transitions_are_monotone() {
        use MessageStatus::*;
        assert!(Queued.can_transition(Sent));
        assert!(Queued.can_transition(Delivered));
        assert!(Sent.can_transition(Delivered));
        assert!(Delivered.can_transition(Read));
        assert!(!Sent.can_transition(Queued));
        assert!(!Delivered.can_transition(Sent));
        assert!(!Read.can_transition(Delivered));
    }

    #[test]
    fn test_failed_only_from_queued_or_sent() {
        use MessageStatus::*;
        assert!(Queued.can_transition(Failed));
        assert!(Sent.can_transition(Failed));
        assert!(!Delivered.can_transition(Failed));
        assert!(!Read.can_transition(Failed));
        assert!(!Failed.can_transition(Queued));
        assert!(!Failed.can_transition(Sent));
    }

    #[test]
    fn test_outbound_message_starts_queued() {
        let session = Session {
            session_id: "s1".into(),
            peer_identity: "peer".into(),
            local_device_id: "dev1".into(),
            created_at: now_ms(),
        };
        let msg = Message::outbound(
            &session,
            "me".into(),
            ContentType::Text,
            vec![1, 2, 3],
            VectorClock::new().incremented("dev1"),
        );
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.attempts, 0);
        assert_eq!(msg.recipient, "peer");
        assert!(msg.id.starts_with("msg_dev1_"));
    }
}
