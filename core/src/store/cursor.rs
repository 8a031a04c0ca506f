// Per-session sync cursors — the last vector clock known to be in common
// with the peer. A crashed sync resumes from here.

use super::backend::StorageBackend;
use super::{keys, StoreError};
use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub session_id: String,
    pub last_common_vc: VectorClock,
    pub last_sync_at: u64,
}

pub struct SyncCursorStore {
    backend: Arc<dyn StorageBackend>,
}

fn cursor_key(session_id: &str) -> Vec<u8> {
    format!("{}{}", keys::CURSOR, session_id).into_bytes()
}

impl SyncCursorStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SyncCursor>, StoreError> {
        match self.backend.get(&cursor_key(session_id))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| StoreError::Corruption(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, cursor: &SyncCursor) -> Result<(), StoreError> {
        let bytes =
            bincode::serialize(cursor).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(&cursor_key(&cursor.session_id), &bytes)
    }

    pub fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.backend.remove(&cursor_key(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn test_cursor_roundtrip() {
        let store = SyncCursorStore::new(Arc::new(MemoryStorage::new()));
        assert!(store.get("s1").unwrap().is_none());

        let cursor = SyncCursor {
            session_id: "s1".into(),
            last_common_vc: VectorClock::new().incremented("dev1"),
            last_sync_at: 42,
        };
        store.put(&cursor).unwrap();
        assert_eq!(store.get("s1").unwrap().unwrap(), cursor);

        store.remove("s1").unwrap();
        assert!(store.get("s1").unwrap().is_none());
    }
}
