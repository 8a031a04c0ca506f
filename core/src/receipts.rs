// Read-receipt batching — coalesce mark-read events within a window into
// one frame per session.
//
// Pure bookkeeping with injected timestamps; the async flush driver lives
// with the bus. Delivered receipts never come through here — the bus sends
// those immediately.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Debounce window after the first insert (ms)
    pub batch_delay_ms: u64,
    /// Flush immediately at this many ids
    pub max_batch_size: usize,
    /// Failed flushes re-arm this many times, then drop
    pub max_retries: u32,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_delay_ms: 500,
            max_batch_size: 50,
            max_retries: 3,
        }
    }
}

/// One batch ready to go on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFlush {
    pub session_id: String,
    pub message_ids: Vec<String>,
    pub retries: u32,
}

struct SessionBatch {
    ids: BTreeSet<String>,
    deadline: u64,
    retries: u32,
}

pub struct ReadReceiptBatcher {
    config: BatcherConfig,
    batches: Mutex<HashMap<String, SessionBatch>>,
}

impl ReadReceiptBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            config,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Add a read message id to its session's batch. The first insert arms
    /// the debounce timer. Returns a flush when the batch hits the size cap
    /// — the caller should send it immediately.
    pub fn add(&self, session_id: &str, message_id: &str, now: u64) -> Option<BatchFlush> {
        let mut batches = self.batches.lock();
        let batch = batches
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBatch {
                ids: BTreeSet::new(),
                deadline: now + self.config.batch_delay_ms,
                retries: 0,
            });

        batch.ids.insert(message_id.to_string());

        if batch.ids.len() >= self.config.max_batch_size {
            let batch = batches.remove(session_id).expect("batch just inserted");
            debug!(session_id, count = batch.ids.len(), "receipt batch hit size cap");
            return Some(BatchFlush {
                session_id: session_id.to_string(),
                message_ids: batch.ids.into_iter().collect(),
                retries: batch.retries,
            });
        }
        None
    }

    /// Batches whose debounce window has elapsed. Removed from the pending
    /// set — a failed send must be handed back via `mark_failed`.
    pub fn due(&self, now: u64) -> Vec<BatchFlush> {
        let mut batches = self.batches.lock();
        let ready: Vec<String> = batches
            .iter()
            .filter(|(_, b)| b.deadline <= now && !b.ids.is_empty())
            .map(|(session, _)| session.clone())
            .collect();

        ready
            .into_iter()
            .map(|session_id| {
                let batch = batches.remove(&session_id).expect("key from same map");
                BatchFlush {
                    session_id,
                    message_ids: batch.ids.into_iter().collect(),
                    retries: batch.retries,
                }
            })
            .collect()
    }

    /// A flush failed to reach the wire: re-add the ids with an exponential
    /// retry delay, unless the retry budget is spent. Returns false when the
    /// batch was dropped.
    pub fn mark_failed(&self, flush: BatchFlush, now: u64) -> bool {
        let retries = flush.retries + 1;
        if retries > self.config.max_retries {
            warn!(
                session_id = %flush.session_id,
                dropped = flush.message_ids.len(),
                "receipt batch dropped after retries"
            );
            return false;
        }

        let delay_ms = 1000u64.saturating_mul(1 << (retries - 1).min(20));
        let mut batches = self.batches.lock();
        let batch = batches
            .entry(flush.session_id.clone())
            .or_insert_with(|| SessionBatch {
                ids: BTreeSet::new(),
                deadline: now + delay_ms,
                retries,
            });
        // Merging into a newer batch keeps the larger retry count and the
        // later deadline
        batch.retries = batch.retries.max(retries);
        batch.deadline = batch.deadline.max(now + delay_ms);
        for id in flush.message_ids {
            batch.ids.insert(id);
        }
        true
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.batches
            .lock()
            .get(session_id)
            .map(|b| b.ids.len())
            .unwrap_or(0)
    }
}
