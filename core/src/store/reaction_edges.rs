// Reaction edge rows.
//
// One row per `(message_id, reactor, emoji)` — the key *is* the primary key,
// so uniqueness holds by construction and toggling is a single get/remove or
// get/put. A reactor-keyed index row mirrors each edge for `recent_for`
// lookups.

use super::backend::StorageBackend;
use super::{keys, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single reactor's emoji on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEdge {
    pub message_id: String,
    pub reactor: String,
    pub emoji: String,
    pub created_at: u64,
}

/// Result of a toggle: the edge that was inserted or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Added(ReactionEdge),
    Removed(ReactionEdge),
}

pub struct ReactionEdgeStore {
    backend: Arc<dyn StorageBackend>,
    lock: Mutex<()>,
}

fn edge_key(message_id: &str, reactor: &str, emoji: &str) -> Vec<u8> {
    format!("{}{}/{}/{}", keys::REACTION, message_id, reactor, emoji).into_bytes()
}

fn reactor_key(reactor: &str, message_id: &str, emoji: &str) -> Vec<u8> {
    format!("{}{}/{}/{}", keys::REACTOR_INDEX, reactor, message_id, emoji).into_bytes()
}

fn decode_edge(bytes: &[u8]) -> Result<ReactionEdge, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Corruption(e.to_string()))
}

impl ReactionEdgeStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    /// Insert the edge if absent, remove it if present
    pub fn toggle(
        &self,
        message_id: &str,
        reactor: &str,
        emoji: &str,
        now: u64,
    ) -> Result<ToggleOutcome, StoreError> {
        let _guard = self.lock.lock();

        let key = edge_key(message_id, reactor, emoji);
        if let Some(bytes) = self.backend.get(&key)? {
            let edge = decode_edge(&bytes)?;
            self.backend.remove(&key)?;
            self.backend.remove(&reactor_key(reactor, message_id, emoji))?;
            return Ok(ToggleOutcome::Removed(edge));
        }

        let edge = ReactionEdge {
            message_id: message_id.to_string(),
            reactor: reactor.to_string(),
            emoji: emoji.to_string(),
            created_at: now,
        };
        let bytes =
            bincode::serialize(&edge).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.put(&key, &bytes)?;
        self.backend
            .put(&reactor_key(reactor, message_id, emoji), &bytes)?;
        Ok(ToggleOutcome::Added(edge))
    }

    /// Apply a remote reaction event idempotently: `add` inserts if absent,
    /// `remove` deletes if present. Returns whether anything changed.
    pub fn apply(
        &self,
        message_id: &str,
        reactor: &str,
        emoji: &str,
        add: bool,
        at: u64,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();

        let key = edge_key(message_id, reactor, emoji);
        let present = self.backend.get(&key)?.is_some();
        if add == present {
            return Ok(false);
        }

        if add {
            let edge = ReactionEdge {
                message_id: message_id.to_string(),
                reactor: reactor.to_string(),
                emoji: emoji.to_string(),
                created_at: at,
            };
            let bytes =
                bincode::serialize(&edge).map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.backend.put(&key, &bytes)?;
            self.backend
                .put(&reactor_key(reactor, message_id, emoji), &bytes)?;
        } else {
            self.backend.remove(&key)?;
            self.backend.remove(&reactor_key(reactor, message_id, emoji))?;
        }
        Ok(true)
    }

    /// All edges on a message
    pub fn edges_for(&self, message_id: &str) -> Result<Vec<ReactionEdge>, StoreError> {
        let prefix = format!("{}{}/", keys::REACTION, message_id);
        let mut edges = Vec::new();
        for (_, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            edges.push(decode_edge(&value)?);
        }
        Ok(edges)
    }

    /// All edges a reactor has placed, across messages
    pub fn edges_by_reactor(&self, reactor: &str) -> Result<Vec<ReactionEdge>, StoreError> {
        let prefix = format!("{}{}/", keys::REACTOR_INDEX, reactor);
        let mut edges = Vec::new();
        for (_, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            edges.push(decode_edge(&value)?);
        }
        Ok(edges)
    }
}
