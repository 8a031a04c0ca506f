//! Per-session causal sync.
//!
//! Protocol flow:
//! 1. Read the session's cursor, send `sync_request { since_vc }`
//! 2. Peer answers with every message whose clock is not <= since_vc plus
//!    its own clock head
//! 3. Each incoming message is merged: clock observation, dedup insert,
//!    conflict resolution against concurrent local messages
//! 4. The cursor advances after every message, so a crashed sync resumes
//!    where it stopped and a repeated sync transfers nothing
//!
//! The serve side of the same exchange lives here too — both peers can
//! answer a `sync_request`.

use super::resolver::ConflictResolver;
use crate::clock::{Causality, VectorClock};
use crate::message::{now_ms, Frame, Message, MessageStatus, WireMessage};
use crate::store::{MessageStore, StoreError, SyncCursor, SyncCursorStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Sync lifecycle per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    /// Request sent, pulling missed messages
    Catching,
    /// Caught up; live frames keep the session current
    LiveUpdating,
    Error,
}

/// Outcome of one sync round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStats {
    pub session_id: String,
    pub total_messages_synced: u64,
    pub conflicts_resolved: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync already running for session {0}")]
    InProgress(String),
    #[error("Unknown session: {0}")]
    UnknownSession(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct SyncEngine {
    store: Arc<MessageStore>,
    cursors: Arc<SyncCursorStore>,
    resolver: ConflictResolver,
    local_device: String,
    inflight: Mutex<HashSet<String>>,
    phases: Mutex<HashMap<String, SyncPhase>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<MessageStore>,
        cursors: Arc<SyncCursorStore>,
        resolver: ConflictResolver,
        local_device: &str,
    ) -> Self {
        Self {
            store,
            cursors,
            resolver,
            local_device: local_device.to_string(),
            inflight: Mutex::new(HashSet::new()),
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, session_id: &str) -> SyncPhase {
        self.phases
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    fn set_phase(&self, session_id: &str, phase: SyncPhase) {
        self.phases.lock().insert(session_id.to_string(), phase);
    }

    pub fn is_inflight(&self, session_id: &str) -> bool {
        self.inflight.lock().contains(session_id)
    }

    /// Start a sync round: claims the in-progress guard and builds the
    /// request frame from the persisted cursor.
    pub fn begin(&self, session_id: &str) -> Result<Frame, SyncError> {
        {
            let mut inflight = self.inflight.lock();
            if !inflight.insert(session_id.to_string()) {
                return Err(SyncError::InProgress(session_id.to_string()));
            }
        }
        self.set_phase(session_id, SyncPhase::Catching);

        let since_vc = self
            .cursors
            .get(session_id)?
            .map(|c| c.last_common_vc)
            .unwrap_or_default();
        debug!(session_id, "sync round started");
        Ok(Frame::SyncRequest {
            session_id: session_id.to_string(),
            since_vc,
        })
    }

    /// Release the in-progress guard without completing (timeout, link loss)
    pub fn abort(&self, session_id: &str) {
        self.inflight.lock().remove(session_id);
        self.set_phase(session_id, SyncPhase::Error);
    }

    /// Deterministic total order for incoming batches: clock sum, then wall
    /// clock, then id. Consistent with the concurrent tie-breakers, so two
    /// replicas process the same multiset identically.
    pub fn order_incoming(&self, mut messages: Vec<Message>) -> Vec<Message> {
        messages.sort_by(|a, b| {
            a.vector_clock
                .sum()
                .cmp(&b.vector_clock.sum())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        messages
    }

    /// Ingest a sync response. Every message is observed into the cursor
    /// clock (merge with local bump), deduped into the store, and checked
    /// against concurrent local messages. The cursor is persisted after
    /// each message so partial progress survives a crash.
    pub fn apply_response(
        &self,
        session_id: &str,
        messages: Vec<WireMessage>,
        _server_vc: VectorClock,
    ) -> Result<SyncStats, SyncError> {
        let started = Instant::now();

        let mut cursor_vc = self
            .cursors
            .get(session_id)?
            .map(|c| c.last_common_vc)
            .unwrap_or_default();

        let local_messages = self.store.messages_for_session(session_id)?;

        let incoming: Vec<Message> = messages
            .into_iter()
            .filter_map(|wire| wire.into_message(MessageStatus::Delivered).ok())
            .collect();

        let mut synced = 0u64;
        let mut conflicts = 0u64;

        for msg in self.order_incoming(incoming) {
            if msg.session_id != session_id {
                continue;
            }

            for local in &local_messages {
                if local.id != msg.id
                    && local.vector_clock.compare(&msg.vector_clock) == Causality::Concurrent
                {
                    let winner = self.resolver.resolve(local, &msg);
                    conflicts += 1;
                    debug!(
                        session_id,
                        incoming = %msg.id,
                        local = %local.id,
                        winner = ?winner,
                        "resolved concurrent pair"
                    );
                }
            }

            if self.store.insert_remote(&msg)? {
                synced += 1;
            }

            cursor_vc = VectorClock::merge(&cursor_vc, &msg.vector_clock, &self.local_device);
            self.cursors.put(&SyncCursor {
                session_id: session_id.to_string(),
                last_common_vc: cursor_vc.clone(),
                last_sync_at: now_ms(),
            })?;
        }

        self.inflight.lock().remove(session_id);
        self.set_phase(session_id, SyncPhase::LiveUpdating);

        let stats = SyncStats {
            session_id: session_id.to_string(),
            total_messages_synced: synced,
            conflicts_resolved: conflicts,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            session_id,
            synced = stats.total_messages_synced,
            conflicts = stats.conflicts_resolved,
            "sync round completed"
        );
        Ok(stats)
    }

    /// Serve a peer's sync request: every stored message for the session
    /// whose clock is not <= since_vc, plus our clock head.
    pub fn serve(
        &self,
        session_id: &str,
        since_vc: &VectorClock,
    ) -> Result<(Vec<WireMessage>, VectorClock), SyncError> {
        let messages: Vec<WireMessage> = self
            .store
            .messages_for_session(session_id)?
            .iter()
            .filter(|m| {
                !matches!(
                    m.vector_clock.compare(since_vc),
                    Causality::Before | Causality::Equal
                )
            })
            .map(WireMessage::from_message)
            .collect();

        let server_vc = self.store.clock_head(session_id)?;
        debug!(session_id, count = messages.len(), "serving sync request");
        Ok((messages, server_vc))
    }
}
