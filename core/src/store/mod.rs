// Durable storage: messages, sessions, reactions, outbound queue, sync cursors

pub mod backend;
pub mod cursor;
pub mod messages;
pub mod outbox;
pub mod reaction_edges;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use cursor::{SyncCursor, SyncCursorStore};
pub use messages::MessageStore;
pub use outbox::{OutboundEntry, OutboundQueue, QueueError};
pub use reaction_edges::{ReactionEdge, ReactionEdgeStore, ToggleOutcome};

use crate::message::MessageStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Storage corruption: {0}")]
    Corruption(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("Clock inversion for device {device}: {counter} <= {existing}")]
    ClockInversion {
        device: String,
        counter: u64,
        existing: u64,
    },
    #[error("Blob too large: {0} bytes")]
    BlobTooLarge(usize),
}

/// Key prefixes shared by all row families on one backend
pub(crate) mod keys {
    pub const SESSION: &str = "session/";
    pub const MESSAGE: &str = "msg/";
    pub const MESSAGE_INDEX: &str = "msgidx/";
    pub const CLOCK_HEAD: &str = "clockhead/";
    pub const OUTBOX: &str = "out/";
    pub const OUTBOX_INDEX: &str = "outidx/";
    pub const REACTION: &str = "react/";
    pub const REACTOR_INDEX: &str = "reactor/";
    pub const CURSOR: &str = "cursor/";
}

/// All prefixes included in an export blob
const EXPORT_PREFIXES: &[&str] = &[
    keys::SESSION,
    keys::MESSAGE,
    keys::MESSAGE_INDEX,
    keys::CLOCK_HEAD,
    keys::OUTBOX,
    keys::OUTBOX_INDEX,
    keys::REACTION,
    keys::REACTOR_INDEX,
    keys::CURSOR,
];

/// Serialize every persisted row into a portable blob
pub fn export_all(
    backend: &dyn StorageBackend,
    max_bytes: usize,
) -> Result<Vec<u8>, StoreError> {
    let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for prefix in EXPORT_PREFIXES {
        rows.extend(backend.scan_prefix(prefix.as_bytes())?);
    }

    let blob = bincode::serialize(&rows).map_err(|e| StoreError::Serialization(e.to_string()))?;
    if blob.len() > max_bytes {
        return Err(StoreError::BlobTooLarge(blob.len()));
    }
    Ok(blob)
}

/// Import rows from an export blob, skipping keys that already exist.
/// Returns the number of rows written.
pub fn import_all(
    backend: &dyn StorageBackend,
    blob: &[u8],
    max_bytes: usize,
) -> Result<usize, StoreError> {
    if blob.len() > max_bytes {
        return Err(StoreError::BlobTooLarge(blob.len()));
    }

    let rows: Vec<(Vec<u8>, Vec<u8>)> =
        bincode::deserialize(blob).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut imported = 0;
    for (key, value) in rows {
        if backend.get(&key)?.is_none() {
            backend.put(&key, &value)?;
            imported += 1;
        }
    }
    backend.flush()?;
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_export_import_roundtrip_skips_existing() {
        let src = MemoryStorage::new();
        src.put(b"session/s1", b"one").unwrap();
        src.put(b"msg/s1/m1", b"two").unwrap();
        src.put(b"unrelated/key", b"ignored").unwrap();

        let blob = export_all(&src, 10 * 1024 * 1024).unwrap();

        let dst = MemoryStorage::new();
        dst.put(b"msg/s1/m1", b"already-here").unwrap();

        let imported = import_all(&dst, &blob, 10 * 1024 * 1024).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(dst.get(b"session/s1").unwrap().unwrap(), b"one");
        // Existing rows are never clobbered
        assert_eq!(dst.get(b"msg/s1/m1").unwrap().unwrap(), b"already-here");
        // Rows outside the schema prefixes are not exported
        assert!(dst.get(b"unrelated/key").unwrap().is_none());
    }

    #[test]
    fn test_import_rejects_oversized_blob() {
        let dst = MemoryStorage::new();
        let blob = vec![0u8; 128];
        assert!(matches!(
            import_all(&dst, &blob, 64),
            Err(StoreError::BlobTooLarge(128))
        ));
    }

    #[test]
    fn test_export_respects_size_cap() {
        let src = MemoryStorage::new();
        src.put(b"msg/s1/m1", &[0u8; 256]).unwrap();
        assert!(matches!(
            export_all(&src, 64),
            Err(StoreError::BlobTooLarge(_))
        ));
    }

    #[test]
    fn test_backend_is_object_safe() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        backend.put(b"k", b"v").unwrap();
        assert_eq!(backend.get(b"k").unwrap().unwrap(), b"v");
    }
}
