// Durable outbound queue — frames waiting for relay acknowledgment.
//
// Entries are keyed `out/{session}/{pri}{enqueued_at}/{message_id}` so a
// plain key-ordered scan yields (priority desc, enqueued_at asc): exactly
// the drain order for dispatch and failover replay. A second row family,
// `outidx/{message_id}`, points back at the full key so ACK removal doesn't
// scan.
//
// An entry exists iff its message is Queued or Sent-without-delivery; the
// bus removes it on Delivered/Failed.

use super::backend::StorageBackend;
use super::{keys, StoreError};
use crate::message::Priority;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Outbound queue full ({0} entries)")]
    Full(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One queued outbound frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEntry {
    pub message_id: String,
    pub session_id: String,
    pub priority: Priority,
    pub attempts: u32,
    /// When this entry was queued (ms)
    pub enqueued_at: u64,
    /// Earliest next dispatch time (ms); honored by the dispatcher
    pub next_attempt_at: u64,
    /// Encoded wire frame, ready to send
    pub frame_blob: Vec<u8>,
}

pub struct OutboundQueue {
    backend: Arc<dyn StorageBackend>,
    max_size: usize,
    lock: Mutex<()>,
}

fn entry_key(entry: &OutboundEntry) -> Vec<u8> {
    format!(
        "{}{}/{}{:020}/{}",
        keys::OUTBOX,
        entry.session_id,
        entry.priority.rank(),
        entry.enqueued_at,
        entry.message_id
    )
    .into_bytes()
}

fn index_key(message_id: &str) -> Vec<u8> {
    format!("{}{}", keys::OUTBOX_INDEX, message_id).into_bytes()
}

fn decode_entry(bytes: &[u8]) -> Result<OutboundEntry, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Corruption(e.to_string()))
}

fn encode_entry(entry: &OutboundEntry) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(entry).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl OutboundQueue {
    pub fn new(backend: Arc<dyn StorageBackend>, max_size: usize) -> Self {
        Self {
            backend,
            max_size,
            lock: Mutex::new(()),
        }
    }

    /// Queue a frame for delivery. When the queue is at capacity the oldest
    /// Low-priority entry is evicted to make room; if there is none, the
    /// enqueue is refused.
    pub fn enqueue(&self, entry: OutboundEntry) -> Result<(), QueueError> {
        let _guard = self.lock.lock();

        let depth = self.backend.count_prefix(keys::OUTBOX.as_bytes())?;
        if depth >= self.max_size {
            match self.oldest_low_priority()? {
                Some(victim) => {
                    self.remove_locked(&victim.message_id)?;
                    debug!(
                        evicted = %victim.message_id,
                        "outbound queue full, evicted oldest low-priority entry"
                    );
                }
                None => return Err(QueueError::Full(depth)),
            }
        }

        let key = entry_key(&entry);
        self.backend.put(&key, &encode_entry(&entry)?)?;
        self.backend.put(&index_key(&entry.message_id), &key)?;
        debug!(message_id = %entry.message_id, session_id = %entry.session_id, "enqueued outbound frame");
        Ok(())
    }

    fn oldest_low_priority(&self) -> Result<Option<OutboundEntry>, StoreError> {
        let mut oldest: Option<OutboundEntry> = None;
        for (_, value) in self.backend.scan_prefix(keys::OUTBOX.as_bytes())? {
            let entry = decode_entry(&value)?;
            if entry.priority != Priority::Low {
                continue;
            }
            let is_older = oldest
                .as_ref()
                .map(|o| entry.enqueued_at < o.enqueued_at)
                .unwrap_or(true);
            if is_older {
                oldest = Some(entry);
            }
        }
        Ok(oldest)
    }

    /// Entries for one session that are due for dispatch at `now`, in drain
    /// order (priority desc, enqueued_at asc)
    pub fn due_for_session(
        &self,
        session_id: &str,
        now: u64,
        limit: usize,
    ) -> Result<Vec<OutboundEntry>, StoreError> {
        let prefix = format!("{}{}/", keys::OUTBOX, session_id);
        let mut due = Vec::new();
        for (_, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            let entry = decode_entry(&value)?;
            if entry.next_attempt_at <= now {
                due.push(entry);
                if due.len() >= limit {
                    break;
                }
            }
        }
        Ok(due)
    }

    /// Every entry for one session, in drain order
    pub fn entries_for_session(&self, session_id: &str) -> Result<Vec<OutboundEntry>, StoreError> {
        let prefix = format!("{}{}/", keys::OUTBOX, session_id);
        let mut entries = Vec::new();
        for (_, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            entries.push(decode_entry(&value)?);
        }
        Ok(entries)
    }

    /// Every entry across all sessions, in global drain order. Used by the
    /// failover replay snapshot.
    pub fn all_entries(&self) -> Result<Vec<OutboundEntry>, StoreError> {
        let mut entries = Vec::new();
        for (_, value) in self.backend.scan_prefix(keys::OUTBOX.as_bytes())? {
            entries.push(decode_entry(&value)?);
        }
        entries.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        Ok(entries)
    }

    /// Remove an entry after ACK or terminal failure. Returns false when the
    /// id is not queued.
    pub fn remove(&self, message_id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock();
        self.remove_locked(message_id)
    }

    fn remove_locked(&self, message_id: &str) -> Result<bool, StoreError> {
        match self.backend.get(&index_key(message_id))? {
            Some(key) => {
                self.backend.remove(&key)?;
                self.backend.remove(&index_key(message_id))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record a failed attempt: bumps the counter and pushes
    /// `next_attempt_at` out by `base · 2^(attempts-1)`, capped.
    /// Returns the new attempt count.
    pub fn record_attempt(
        &self,
        message_id: &str,
        base_ms: u64,
        max_backoff_ms: u64,
        now: u64,
    ) -> Result<u32, StoreError> {
        let _guard = self.lock.lock();

        let key = self
            .backend
            .get(&index_key(message_id))?
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        let mut entry = decode_entry(
            &self
                .backend
                .get(&key)?
                .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?,
        )?;

        entry.attempts += 1;
        let shift = (entry.attempts - 1).min(20);
        let backoff = base_ms.saturating_mul(1u64 << shift).min(max_backoff_ms);
        entry.next_attempt_at = now + backoff;

        self.backend.put(&key, &encode_entry(&entry)?)?;
        debug!(
            message_id,
            attempts = entry.attempts,
            backoff_ms = backoff,
            "recorded outbound attempt"
        );
        Ok(entry.attempts)
    }

    /// Push an entry's next dispatch time out without counting an attempt.
    /// Used after the relay accepts a frame: the entry lingers awaiting the
    /// peer delivery receipt, but must not be re-sent right away.
    pub fn defer(&self, message_id: &str, until: u64) -> Result<(), StoreError> {
        let _guard = self.lock.lock();

        let key = match self.backend.get(&index_key(message_id))? {
            Some(key) => key,
            None => return Ok(()),
        };
        let mut entry = match self.backend.get(&key)? {
            Some(bytes) => decode_entry(&bytes)?,
            None => return Ok(()),
        };
        entry.next_attempt_at = entry.next_attempt_at.max(until);
        self.backend.put(&key, &encode_entry(&entry)?)
    }

    /// Total queued entries
    pub fn depth(&self) -> Result<usize, StoreError> {
        self.backend.count_prefix(keys::OUTBOX.as_bytes())
    }

    pub fn depth_for_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let prefix = format!("{}{}/", keys::OUTBOX, session_id);
        self.backend.count_prefix(prefix.as_bytes())
    }

    /// Drop entries older than `max_age_ms`. Returns how many were removed.
    pub fn remove_expired(&self, max_age_ms: u64, now: u64) -> Result<usize, StoreError> {
        let _guard = self.lock.lock();

        let mut removed = 0;
        for (key, value) in self.backend.scan_prefix(keys::OUTBOX.as_bytes())? {
            let entry = decode_entry(&value)?;
            if now.saturating_sub(entry.enqueued_at) >= max_age_ms {
                self.backend.remove(&key)?;
                self.backend.remove(&index_key(&entry.message_id))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "dropped expired outbound entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn queue(max: usize) -> OutboundQueue {
        OutboundQueue::new(Arc::new(MemoryStorage::new()), max)
    }

    fn entry(id: &str, session: &str, priority: Priority, enqueued_at: u64) -> OutboundEntry {
        OutboundEntry {
            message_id: id.into(),
            session_id: session.into(),
            priority,
            attempts: 0,
            enqueued_at,
            next_attempt_at: 0,
            frame_blob: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_enqueue_and_depth() {
        let q = queue(10);
        q.enqueue(entry("m1", "s1", Priority::Normal, 1)).unwrap();
        q.enqueue(entry("m2", "s1", Priority::Normal, 2)).unwrap();
        q.enqueue(entry("m3", "s2", Priority::Normal, 3)).unwrap();

        assert_eq!(q.depth().unwrap(), 3);
        assert_eq!(q.depth_for_session("s1").unwrap(), 2);
        assert_eq!(q.depth_for_session("s2").unwrap(), 1);
    }

    #[test]
    fn test_drain_order_priority_then_age() {
        let q = queue(10);
        q.enqueue(entry("old-low", "s1", Priority::Low, 1)).unwrap();
        q.enqueue(entry("new-high", "s1", Priority::High, 9)).unwrap();
        q.enqueue(entry("mid-normal", "s1", Priority::Normal, 5)).unwrap();
        q.enqueue(entry("old-high", "s1", Priority::High, 2)).unwrap();

        let order: Vec<String> = q
            .entries_for_session("s1")
            .unwrap()
            .into_iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(order, vec!["old-high", "new-high", "mid-normal", "old-low"]);
    }

    #[test]
    fn test_due_honors_next_attempt_at() {
        let q = queue(10);
        let mut waiting = entry("m1", "s1", Priority::Normal, 1);
        waiting.next_attempt_at = 1000;
        q.enqueue(waiting).unwrap();
        q.enqueue(entry("m2", "s1", Priority::Normal, 2)).unwrap();

        let due: Vec<String> = q
            .due_for_session("s1", 500, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(due, vec!["m2"]);

        let due_later = q.due_for_session("s1", 1001, 10).unwrap();
        assert_eq!(due_later.len(), 2);
    }

    #[test]
    fn test_full_queue_evicts_oldest_low_priority() {
        let q = queue(2);
        q.enqueue(entry("low-old", "s1", Priority::Low, 1)).unwrap();
        q.enqueue(entry("low-new", "s1", Priority::Low, 5)).unwrap();
        q.enqueue(entry("m3", "s1", Priority::High, 9)).unwrap();

        assert_eq!(q.depth().unwrap(), 2);
        assert!(!q.remove("low-old").unwrap()); // evicted
        assert!(q.remove("low-new").unwrap());
        assert!(q.remove("m3").unwrap());
    }

    #[test]
    fn test_full_queue_without_low_priority_refuses() {
        let q = queue(2);
        q.enqueue(entry("m1", "s1", Priority::High, 1)).unwrap();
        q.enqueue(entry("m2", "s1", Priority::Normal, 2)).unwrap();

        let err = q.enqueue(entry("m3", "s1", Priority::Normal, 3)).unwrap_err();
        assert!(matches!(err, QueueError::Full(2)));
    }

    #[test]
    fn test_remove_by_id() {
        let q = queue(10);
        q.enqueue(entry("m1", "s1", Priority::Normal, 1)).unwrap();

        assert!(q.remove("m1").unwrap());
        assert!(!q.remove("m1").unwrap());
        assert_eq!(q.depth().unwrap(), 0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let q = queue(10);
        q.enqueue(entry("m1", "s1", Priority::Normal, 0)).unwrap();

        assert_eq!(q.record_attempt("m1", 100, 1000, 0).unwrap(), 1);
        let e = &q.entries_for_session("s1").unwrap()[0];
        assert_eq!(e.next_attempt_at, 100); // base * 2^0

        assert_eq!(q.record_attempt("m1", 100, 1000, 0).unwrap(), 2);
        let e = &q.entries_for_session("s1").unwrap()[0];
        assert_eq!(e.next_attempt_at, 200); // base * 2^1

        for _ in 0..6 {
            q.record_attempt("m1", 100, 1000, 0).unwrap();
        }
        let e = &q.entries_for_session("s1").unwrap()[0];
        assert_eq!(e.next_attempt_at, 1000); // capped
    }

    #[test]
    fn test_defer_pushes_dispatch_out_without_attempt() {
        let q = queue(10);
        q.enqueue(entry("m1", "s1", Priority::Normal, 1)).unwrap();

        q.defer("m1", 5_000).unwrap();
        assert!(q.due_for_session("s1", 4_999, 10).unwrap().is_empty());
        let e = &q.due_for_session("s1", 5_000, 10).unwrap()[0];
        assert_eq!(e.attempts, 0);

        // Unknown id is a no-op
        q.defer("ghost", 5_000).unwrap();
    }

    #[test]
    fn test_global_drain_order_spans_sessions() {
        let q = queue(10);
        q.enqueue(entry("b-normal", "sB", Priority::Normal, 2)).unwrap();
        q.enqueue(entry("a-high", "sA", Priority::High, 9)).unwrap();
        q.enqueue(entry("b-high", "sB", Priority::High, 1)).unwrap();

        let order: Vec<String> = q
            .all_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(order, vec!["b-high", "a-high", "b-normal"]);
    }

    #[test]
    fn test_remove_expired() {
        let q = queue(10);
        q.enqueue(entry("stale", "s1", Priority::Normal, 0)).unwrap();
        q.enqueue(entry("fresh", "s1", Priority::Normal, 9_000)).unwrap();

        let removed = q.remove_expired(5_000, 10_000).unwrap();
        assert_eq!(removed, 1);
        assert!(!q.remove("stale").unwrap());
        assert!(q.remove("fresh").unwrap());
    }
}
