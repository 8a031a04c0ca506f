// SolConnect Messaging Core
//
// "Can two wallets exchange an encrypted message while relays come and go?"
//
// Everything in this crate serves that question: durable per-session state,
// vector-clock ordering, offline queueing, and sub-second relay failover.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod message;
pub mod metrics;
pub mod reactions;
pub mod receipts;
pub mod relay;
pub mod store;
pub mod sync;
pub mod transport;

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use clock::{Causality, VectorClock};
pub use config::{ConfigError, CoreConfig};
pub use crypto::{Cipher, CryptoError, SessionCipher};
pub use error::{CoreError, CoreResult, ErrorCategory};
pub use events::{CoreEvent, EventBus, Subscription};
pub use message::{
    ContentType, Frame, Message, MessageStatus, Priority, ProtocolError, Session,
};
pub use metrics::{CoreMetrics, MetricsSnapshot, TimedOp};
pub use reactions::{ReactionEngine, ReactionError, ReactionSummary, RecentReaction};
pub use receipts::{BatchFlush, BatcherConfig, ReadReceiptBatcher};
pub use relay::{
    Alert, AlertSeverity, FailoverPhase, FailoverReport, FailoverTrigger, HealthMonitor,
    RelayDirectory, RelayEndpoint, SelectionStrategy,
};
pub use store::{
    MemoryStorage, MessageStore, OutboundEntry, OutboundQueue, ReactionEdgeStore, SledStorage,
    StorageBackend, StoreError, SyncCursorStore, ToggleOutcome,
};
pub use sync::{ConflictResolver, ResolutionStrategy, SyncEngine, SyncStats};
pub use transport::{
    CircuitBreaker, Connector, Link, LinkState, MemoryConnector, MemoryRelay, TransportError,
    WsConnector,
};

use message::{codec, derive_session_id, now_ms, AckStatus, ReceiptEntry, ReceiptStatus, WireMessage};
use receipts::BatchFlush as ReceiptFlush;
use relay::{failover::FailoverConfig, AlertKind, FailoverEngine};
use sync::ordering::CausalBuffer;

/// What `send` hands back immediately. `Queued` is a valid success — the
/// caller watches status events for the rest of the lifecycle.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: u64,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Ready,
    Stopped,
}

/// The messaging core façade. One instance per user session; cheap to clone
/// behind `Arc`. Construction is explicit (`init`), shutdown is a method.
pub struct MessageBus {
    config: CoreConfig,
    identity: String,

    backend: Arc<dyn StorageBackend>,
    store: Arc<MessageStore>,
    outbox: Arc<OutboundQueue>,
    cursors: Arc<SyncCursorStore>,
    cipher: Arc<SessionCipher>,
    reactions: ReactionEngine,
    batcher: ReadReceiptBatcher,
    sync_engine: SyncEngine,

    connector: Arc<dyn Connector>,
    directory: Arc<RelayDirectory>,
    failover: Arc<FailoverEngine>,
    health: Arc<HealthMonitor>,
    breaker: SyncMutex<CircuitBreaker>,

    events: EventBus,
    metrics: Arc<CoreMetrics>,

    primary: SyncRwLock<Option<Arc<dyn Link>>>,
    session_locks: SyncMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    reorder: SyncMutex<HashMap<String, CausalBuffer>>,
    pending_syncs: SyncMutex<HashMap<String, oneshot::Sender<SyncStats>>>,

    state: SyncMutex<BusState>,
    stopped: AtomicBool,
    tasks_started: AtomicBool,
    tasks: SyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MessageBus {
    /// Build a core over the default WebSocket transport
    pub fn init(config: CoreConfig, identity: &str) -> CoreResult<Arc<Self>> {
        Self::init_with_connector(config, identity, Arc::new(WsConnector::new()))
    }

    /// Build a core with an injected transport (tests use the in-memory one)
    pub fn init_with_connector(
        config: CoreConfig,
        identity: &str,
        connector: Arc<dyn Connector>,
    ) -> CoreResult<Arc<Self>> {
        // Initialize tracing (idempotent)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        config.validate()?;
        if identity.is_empty() {
            return Err(CoreError::validation("EMPTY_IDENTITY", "Identity must be set"));
        }

        let backend: Arc<dyn StorageBackend> = match &config.storage_path {
            Some(path) => Arc::new(SledStorage::open(path)?),
            None => Arc::new(MemoryStorage::new()),
        };

        let store = Arc::new(MessageStore::new(backend.clone()));
        let outbox = Arc::new(OutboundQueue::new(backend.clone(), config.queue_max_size));
        let cursors = Arc::new(SyncCursorStore::new(backend.clone()));
        let edges = Arc::new(ReactionEdgeStore::new(backend.clone()));
        let cipher = Arc::new(SessionCipher::new());

        let directory = Arc::new(RelayDirectory::new(
            config.relay_endpoints.clone(),
            config.selection_strategy,
            config.preferred_regions.clone(),
        ));

        let failover = Arc::new(FailoverEngine::new(
            directory.clone(),
            connector.clone(),
            outbox.clone(),
            store.clone(),
            identity.to_string(),
            FailoverConfig {
                connection_timeout: Duration::from_millis(config.connection_timeout_ms),
                graceful_disconnect_timeout: Duration::from_millis(
                    config.graceful_disconnect_timeout_ms,
                ),
                retry_attempts: config.retry_attempts,
                cooldown_ms: config.failover_cooldown_ms,
            },
        ));

        let sync_engine = SyncEngine::new(
            store.clone(),
            cursors.clone(),
            ConflictResolver::new(ResolutionStrategy::VectorClock),
            &config.device_id,
        );

        let batcher = ReadReceiptBatcher::new(BatcherConfig {
            batch_delay_ms: config.batch_delay_ms,
            max_batch_size: config.batch_max_size,
            max_retries: config.batch_max_retries,
        });

        let health = Arc::new(HealthMonitor::new(
            "",
            config.health_thresholds.clone(),
            now_ms(),
        ));

        let breaker = SyncMutex::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_cooldown_ms,
        ));

        info!(device = %config.device_id, "messaging core initialized");
        Ok(Arc::new(Self {
            identity: identity.to_string(),
            reactions: ReactionEngine::new(edges),
            batcher,
            sync_engine,
            backend,
            store,
            outbox,
            cursors,
            cipher,
            connector,
            directory,
            failover,
            health,
            breaker,
            events: EventBus::new(1024),
            metrics: Arc::new(CoreMetrics::new()),
            primary: SyncRwLock::new(None),
            session_locks: SyncMutex::new(HashMap::new()),
            reorder: SyncMutex::new(HashMap::new()),
            pending_syncs: SyncMutex::new(HashMap::new()),
            state: SyncMutex::new(BusState::Ready),
            stopped: AtomicBool::new(false),
            tasks_started: AtomicBool::new(false),
            tasks: SyncMutex::new(Vec::new()),
            config,
        }))
    }

    fn ensure_ready(&self) -> CoreResult<()> {
        match *self.state.lock() {
            BusState::Ready => Ok(()),
            BusState::Stopped => Err(CoreError::not_ready()),
        }
    }

    fn primary_link(&self) -> Option<Arc<dyn Link>> {
        self.primary.read().clone()
    }

    /// Online = a connected primary link exists
    pub fn is_connected(&self) -> bool {
        self.primary_link()
            .map(|l| l.state() == LinkState::Connected)
            .unwrap_or(false)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn directory(&self) -> &RelayDirectory {
        &self.directory
    }

    async fn session_guard(&self, session_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.session_locks.lock();
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Establish the primary relay connection and start the background
    /// drivers. Safe to call again after a disconnect-free link loss.
    pub async fn connect(self: &Arc<Self>) -> CoreResult<()> {
        self.ensure_ready()?;
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = self.directory.select()?;
        let link = self
            .connector
            .connect(&endpoint, Duration::from_millis(self.config.connection_timeout_ms))
            .await
            .map_err(|e| {
                self.directory.mark_unhealthy(&endpoint.id);
                CoreError::from(e)
            })?;

        self.directory.note_connection(&endpoint.id, true);
        link.send(Frame::handshake(self.identity.clone(), String::new()))
            .await?;
        self.health.reset(&endpoint.id, now_ms());
        *self.primary.write() = Some(link);
        self.events.emit(CoreEvent::ConnectionChanged {
            endpoint_id: endpoint.id.clone(),
            state: LinkState::Connected,
        });
        info!(relay = %endpoint.id, "primary link established");

        self.spawn_background_tasks();
        Ok(())
    }

    /// Graceful shutdown. Best effort — never fails the caller.
    pub async fn disconnect(&self) -> CoreResult<()> {
        *self.state.lock() = BusState::Stopped;
        self.stopped.store(true, Ordering::SeqCst);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let link = self.primary.write().take();
        if let Some(link) = link {
            let endpoint_id = link.endpoint_id();
            let _ = tokio::time::timeout(
                Duration::from_millis(self.config.graceful_disconnect_timeout_ms),
                link.close("client disconnect"),
            )
            .await;
            self.directory.note_connection(&endpoint_id, false);
            self.events.emit(CoreEvent::ConnectionChanged {
                endpoint_id,
                state: LinkState::Disconnected,
            });
        }

        let _ = self.backend.flush();
        info!("messaging core disconnected");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Open (or reopen) the conversation with a peer. Idempotent per peer:
    /// an existing session is returned as-is, with its key refreshed.
    pub fn start_session(&self, peer_identity: &str, shared_key: &[u8; 32]) -> CoreResult<Session> {
        self.start_session_at(peer_identity, shared_key, now_ms())
    }

    /// `start_session` with an explicit creation epoch. Both sides must use
    /// the same epoch (it is part of the conversation bootstrap) so the
    /// derived session id matches.
    pub fn start_session_at(
        &self,
        peer_identity: &str,
        shared_key: &[u8; 32],
        epoch: u64,
    ) -> CoreResult<Session> {
        self.ensure_ready()?;
        reactions::validate_reactor(peer_identity)
            .map_err(|e| CoreError::validation("INVALID_IDENTITY", e.to_string()))?;

        if let Some(existing) = self
            .store
            .list_sessions()?
            .into_iter()
            .find(|s| s.peer_identity == peer_identity)
        {
            self.cipher.register_session(&existing.session_id, shared_key);
            return Ok(existing);
        }

        let session = Session {
            session_id: derive_session_id(&self.identity, peer_identity, epoch),
            peer_identity: peer_identity.to_string(),
            local_device_id: self.config.device_id.clone(),
            created_at: epoch,
        };
        self.store.put_session(&session)?;
        self.cipher.register_session(&session.session_id, shared_key);
        debug!(session_id = %session.session_id, "session started");
        Ok(session)
    }

    /// Explicit end-session: drops the key and every stored row
    pub async fn end_session(&self, session_id: &str) -> CoreResult<usize> {
        self.ensure_ready()?;
        let _guard = self.session_guard(session_id).await;

        for entry in self.outbox.entries_for_session(session_id)? {
            self.outbox.remove(&entry.message_id)?;
        }
        self.cursors.remove(session_id)?;
        self.cipher.remove_session(session_id);
        self.reorder.lock().remove(session_id);
        let removed = self.store.remove_session_rows(session_id)?;
        Ok(removed)
    }

    pub fn sessions(&self) -> CoreResult<Vec<Session>> {
        self.ensure_ready()?;
        Ok(self.store.list_sessions()?)
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Encrypt, persist, queue, and opportunistically dispatch a message.
    /// The message is durable before any network attempt; `Queued` is a
    /// valid success when offline.
    pub async fn send(self: &Arc<Self>, session_id: &str, text: &str) -> CoreResult<SendReceipt> {
        self.ensure_ready()?;
        let started = Instant::now();

        if text.is_empty() {
            return Err(CoreError::validation("EMPTY_MESSAGE", "Message is empty"));
        }
        if text.len() > self.config.message_max_bytes {
            return Err(CoreError::validation(
                "MESSAGE_TOO_LARGE",
                format!(
                    "Message is {} bytes (limit {})",
                    text.len(),
                    self.config.message_max_bytes
                ),
            ));
        }

        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| CoreError::validation("UNKNOWN_SESSION", "No such session"))?;

        let _guard = self.session_guard(session_id).await;

        let head = self.store.clock_head(session_id)?;
        let vector_clock = head.incremented(&self.config.device_id);

        let ciphertext = if self.config.enable_encryption {
            self.cipher.encrypt(session_id, text.as_bytes())?
        } else {
            text.as_bytes().to_vec()
        };

        let msg = Message::outbound(
            &session,
            self.identity.clone(),
            ContentType::Text,
            ciphertext,
            vector_clock,
        );
        self.store.append_local(&msg, &self.config.device_id)?;

        let frame = Frame::Chat {
            message: WireMessage::from_message(&msg),
            ttl: None,
        };
        let entry = OutboundEntry {
            message_id: msg.id.clone(),
            session_id: session_id.to_string(),
            priority: Priority::Normal,
            attempts: 0,
            enqueued_at: now_ms(),
            next_attempt_at: 0,
            frame_blob: codec::encode_frame(&frame)?,
        };
        if let Err(e) = self.outbox.enqueue(entry) {
            // No outbound entry may exist for a message that will never be
            // dispatched: fail the row and surface the refusal.
            let _ = self.store.update_status(&msg.id, MessageStatus::Failed);
            return Err(e.into());
        }
        self.metrics.set_queue_depth(self.outbox.depth()? as u64);

        // Opportunistic dispatch; offline or open breaker just leaves the
        // message queued.
        let _ = self.dispatch_session(session_id).await;

        let status = self
            .store
            .get_message(&msg.id)?
            .map(|m| m.status)
            .unwrap_or(MessageStatus::Queued);

        self.metrics
            .record_timing(TimedOp::Send, started.elapsed().as_millis() as u64);
        Ok(SendReceipt {
            message_id: msg.id,
            timestamp: msg.created_at,
            status,
        })
    }

    /// Dispatch every due entry across all sessions. Returns how many frames
    /// went to the wire.
    pub async fn process_queue(self: &Arc<Self>) -> CoreResult<usize> {
        self.ensure_ready()?;
        let link = self.primary_link().ok_or_else(CoreError::offline)?;

        let now = now_ms();
        if !self.breaker.lock().allow(now) {
            return Err(CoreError::circuit_open());
        }

        let due: Vec<OutboundEntry> = self
            .outbox
            .all_entries()?
            .into_iter()
            .filter(|e| e.next_attempt_at <= now)
            .collect();

        let mut sent = 0;
        for entry in due {
            match self.send_entry(&link, &entry).await {
                Ok(()) => sent += 1,
                Err(_) => break,
            }
        }
        self.metrics.set_queue_depth(self.outbox.depth()? as u64);
        Ok(sent)
    }

    async fn dispatch_session(self: &Arc<Self>, session_id: &str) -> CoreResult<usize> {
        let link = self.primary_link().ok_or_else(CoreError::offline)?;
        let now = now_ms();
        if !self.breaker.lock().allow(now) {
            return Err(CoreError::circuit_open());
        }

        let due = self.outbox.due_for_session(session_id, now, 64)?;
        let mut sent = 0;
        for entry in due {
            match self.send_entry(&link, &entry).await {
                Ok(()) => sent += 1,
                Err(_) => break,
            }
        }
        Ok(sent)
    }

    async fn send_entry(&self, link: &Arc<dyn Link>, entry: &OutboundEntry) -> CoreResult<()> {
        let frame = codec::decode_frame(&entry.frame_blob)?;
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        let now = now_ms();

        let outcome = match tokio::time::timeout(timeout, link.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CoreError::from(e)),
            Err(_) => Err(CoreError::from(TransportError::Timeout(timeout))),
        };

        match outcome {
            Ok(()) => {
                self.breaker.lock().record_success();
                self.metrics.incr_messages_sent();
                let _ = self.store.record_attempt(&entry.message_id);
                // Hold the entry back until the relay ack or retry window
                self.outbox
                    .defer(&entry.message_id, now + self.config.retry_base_ms)?;
                Ok(())
            }
            Err(e) => {
                self.breaker.lock().record_failure(now);
                self.health.record_error();
                let attempts = self.outbox.record_attempt(
                    &entry.message_id,
                    self.config.retry_base_ms,
                    self.config.retry_max_ms,
                    now,
                )?;
                if attempts >= self.config.retry_attempts {
                    warn!(message_id = %entry.message_id, "retries exhausted, failing message");
                    self.outbox.remove(&entry.message_id)?;
                    if self
                        .store
                        .update_status(&entry.message_id, MessageStatus::Failed)
                        .unwrap_or(false)
                    {
                        self.emit_status(&entry.session_id, &entry.message_id, MessageStatus::Failed);
                    }
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self, message_id: &str) -> CoreResult<MessageStatus> {
        self.ensure_ready()?;
        let started = Instant::now();
        let status = self
            .store
            .get_message(message_id)?
            .map(|m| m.status)
            .ok_or_else(|| CoreError::validation("UNKNOWN_MESSAGE", "No such message"))?;
        self.metrics.record_timing(
            TimedOp::GetStoredMessages,
            started.elapsed().as_millis() as u64,
        );
        Ok(status)
    }

    pub fn update_status(&self, message_id: &str, status: MessageStatus) -> CoreResult<()> {
        self.ensure_ready()?;
        self.apply_status(message_id, status)?;
        Ok(())
    }

    /// Apply many transitions; returns how many rows changed. Individual
    /// illegal transitions are skipped, not fatal for the batch.
    pub fn batch_update_status(
        &self,
        updates: &[(String, MessageStatus)],
    ) -> CoreResult<usize> {
        self.ensure_ready()?;
        let mut changed = 0;
        for (message_id, status) in updates {
            match self.apply_status(message_id, *status) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => debug!(message_id = %message_id, error = %e, "batch status update skipped"),
            }
        }
        Ok(changed)
    }

    fn apply_status(&self, message_id: &str, status: MessageStatus) -> CoreResult<bool> {
        let changed = self.store.update_status(message_id, status)?;
        if changed {
            // Terminal-for-the-queue statuses release the outbound entry
            if matches!(
                status,
                MessageStatus::Delivered | MessageStatus::Read | MessageStatus::Failed
            ) {
                self.outbox.remove(message_id)?;
            }
            if let Some(msg) = self.store.get_message(message_id)? {
                self.emit_status(&msg.session_id, message_id, status);
            }
        }
        Ok(changed)
    }

    fn emit_status(&self, session_id: &str, message_id: &str, status: MessageStatus) {
        self.events.emit(CoreEvent::StatusChanged {
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            status,
            at: now_ms(),
        });
    }

    /// All messages of a session, oldest first
    pub fn stored_messages(&self, session_id: &str) -> CoreResult<Vec<Message>> {
        self.ensure_ready()?;
        let started = Instant::now();
        let messages = self.store.messages_for_session(session_id)?;
        self.metrics.record_timing(
            TimedOp::GetStoredMessages,
            started.elapsed().as_millis() as u64,
        );
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Mark locally known messages as read. Receipts coalesce into one
    /// frame per session within the batch window.
    pub async fn mark_read(self: &Arc<Self>, session_id: &str, message_ids: &[String]) -> CoreResult<()> {
        self.ensure_ready()?;
        self.store
            .get_session(session_id)?
            .ok_or_else(|| CoreError::validation("UNKNOWN_SESSION", "No such session"))?;

        let _guard = self.session_guard(session_id).await;
        let now = now_ms();

        for message_id in message_ids {
            if self.store.get_message(message_id)?.is_none() {
                debug!(message_id = %message_id, "mark_read skipped unknown message");
                continue;
            }
            match self.store.update_status(message_id, MessageStatus::Read) {
                Ok(true) => self.emit_status(session_id, message_id, MessageStatus::Read),
                Ok(false) => {}
                Err(e) => {
                    debug!(message_id = %message_id, error = %e, "mark_read transition skipped");
                    continue;
                }
            }
            if let Some(flush) = self.batcher.add(session_id, message_id, now) {
                self.flush_receipts(flush).await;
            }
        }
        Ok(())
    }

    async fn flush_receipts(&self, flush: ReceiptFlush) {
        let now = now_ms();
        let frame = Frame::ReadReceiptBatch {
            session_id: flush.session_id.clone(),
            reader: self.identity.clone(),
            receipts: flush
                .message_ids
                .iter()
                .map(|id| ReceiptEntry {
                    message_id: id.clone(),
                    status: ReceiptStatus::Read,
                    at: now,
                })
                .collect(),
        };

        let sent = match self.primary_link() {
            Some(link) => link.send(frame).await.is_ok(),
            None => false,
        };

        if sent {
            self.metrics.incr_batch_flushes();
        } else if !self.batcher.mark_failed(flush, now) {
            warn!("read receipt batch dropped after retries");
        }
    }

    /// Send a Delivered receipt right away — these bypass batching
    async fn send_delivered_receipt(&self, session_id: &str, message_id: &str) {
        let frame = Frame::ReadReceiptBatch {
            session_id: session_id.to_string(),
            reader: self.identity.clone(),
            receipts: vec![ReceiptEntry {
                message_id: message_id.to_string(),
                status: ReceiptStatus::Delivered,
                at: now_ms(),
            }],
        };
        if let Some(link) = self.primary_link() {
            let _ = link.send(frame).await;
        }
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Toggle the local user's reaction on a message. Fans out to local
    /// subscribers and, best effort, to the wire.
    pub async fn toggle_reaction(
        self: &Arc<Self>,
        session_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> CoreResult<ToggleOutcome> {
        self.ensure_ready()?;
        let _guard = self.session_guard(session_id).await;

        let outcome = self.reactions.toggle(message_id, &self.identity, emoji)?;
        let added = matches!(outcome, ToggleOutcome::Added(_));

        self.events.emit(CoreEvent::ReactionChanged {
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            reactor: self.identity.clone(),
            emoji: emoji.to_string(),
            added,
        });

        let frame = Frame::ReactionEvent {
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            reactor: self.identity.clone(),
            emoji: emoji.to_string(),
            op: if added {
                message::ReactionOp::Add
            } else {
                message::ReactionOp::Remove
            },
            at: now_ms(),
        };
        if let Some(link) = self.primary_link() {
            let _ = link.send(frame).await;
        }
        Ok(outcome)
    }

    pub fn reaction_summaries(&self, message_id: &str) -> CoreResult<Vec<ReactionSummary>> {
        self.ensure_ready()?;
        Ok(self
            .reactions
            .summaries(message_id, Some(&self.identity))?)
    }

    pub fn recent_reactions(&self, limit: usize) -> CoreResult<Vec<RecentReaction>> {
        self.ensure_ready()?;
        Ok(self.reactions.recent_for(&self.identity, limit)?)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Run one sync round for a session and wait for the result. Errors
    /// when offline or when a round is already running for the session.
    pub async fn sync(self: &Arc<Self>, session_id: &str) -> CoreResult<SyncStats> {
        self.ensure_ready()?;
        let link = self.primary_link().ok_or_else(CoreError::offline)?;
        let started = Instant::now();

        let request = self.sync_engine.begin(session_id)?;
        let (tx, rx) = oneshot::channel();
        self.pending_syncs.lock().insert(session_id.to_string(), tx);

        if let Err(e) = link.send(request).await {
            self.sync_engine.abort(session_id);
            self.pending_syncs.lock().remove(session_id);
            return Err(e.into());
        }

        let deadline = Duration::from_millis(self.config.send_timeout_ms * 2);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(stats)) => {
                self.metrics
                    .record_timing(TimedOp::Sync, started.elapsed().as_millis() as u64);
                Ok(stats)
            }
            _ => {
                self.sync_engine.abort(session_id);
                self.pending_syncs.lock().remove(session_id);
                Err(CoreError::from(TransportError::Timeout(deadline)))
            }
        }
    }

    /// Sync every known session; returns the total messages pulled
    pub async fn sync_all(self: &Arc<Self>) -> CoreResult<u64> {
        self.ensure_ready()?;
        let mut total = 0;
        for session in self.store.list_sessions()? {
            match self.sync(&session.session_id).await {
                Ok(stats) => total += stats.total_messages_synced,
                Err(e) if e.code == "SYNC_IN_PROGRESS" => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Subscriptions & export
    // ------------------------------------------------------------------

    /// Event stream scoped to one session (global events included).
    /// Handlers run on the subscriber's own task, never inside the core.
    pub fn subscribe(&self, session_id: &str) -> CoreResult<Subscription> {
        self.ensure_ready()?;
        Ok(self.events.subscribe_session(session_id))
    }

    /// Serialize every persisted row into a portable blob
    pub fn export(&self) -> CoreResult<Vec<u8>> {
        self.ensure_ready()?;
        Ok(store::export_all(
            self.backend.as_ref(),
            self.config.import_max_bytes,
        )?)
    }

    /// Import rows from an export blob; existing rows win. Returns the
    /// number of rows written.
    pub fn import(&self, blob: &[u8]) -> CoreResult<usize> {
        self.ensure_ready()?;
        Ok(store::import_all(
            self.backend.as_ref(),
            blob,
            self.config.import_max_bytes,
        )?)
    }

    // ------------------------------------------------------------------
    // Background drivers
    // ------------------------------------------------------------------

    fn spawn_background_tasks(self: &Arc<Self>) {
        if self.tasks_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(Self::pump_loop(self.clone())));
        tasks.push(tokio::spawn(Self::ping_loop(self.clone())));
        tasks.push(tokio::spawn(Self::batch_loop(self.clone())));
        tasks.push(tokio::spawn(Self::dispatch_loop(self.clone())));
        if self.config.auto_sync_interval_ms.is_some() {
            tasks.push(tokio::spawn(Self::auto_sync_loop(self.clone())));
        }
        // Auto-discovery keeps the catalog probed even without an explicit
        // health-check interval
        if self.config.health_check_interval_ms > 0 || self.config.enable_auto_discovery {
            tasks.push(tokio::spawn(Self::health_check_loop(self.clone())));
        }
        debug!("background drivers started");
    }

    /// Inbound frame pump: reads the current primary link; on loss, runs
    /// failover and carries on with the new link.
    async fn pump_loop(bus: Arc<Self>) {
        loop {
            if bus.stopped.load(Ordering::SeqCst) {
                break;
            }
            let Some(link) = bus.primary_link() else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };

            match link.recv().await {
                Ok(frame) => bus.handle_frame(frame, &link).await,
                Err(e) => {
                    if bus.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "primary link lost");
                    bus.handle_link_loss(FailoverTrigger::TransportClosed).await;
                }
            }
        }
    }

    async fn ping_loop(bus: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(bus.config.ping_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if bus.stopped.load(Ordering::SeqCst) {
                break;
            }
            let Some(link) = bus.primary_link() else { continue };
            let now = now_ms();

            let expired = bus
                .health
                .expire_pending_pings(now, bus.config.ping_timeout_ms);
            if !expired.is_empty() {
                let alert = bus.health.ping_timeout_alert(bus.config.ping_timeout_ms);
                bus.events.emit(CoreEvent::HealthAlert(alert));
                bus.handle_link_loss(FailoverTrigger::HealthCritical).await;
                continue;
            }

            for alert in bus.health.evaluate(now) {
                let critical =
                    alert.severity == AlertSeverity::Critical && alert.kind != AlertKind::PingTimeout;
                bus.events.emit(CoreEvent::HealthAlert(alert));
                if critical {
                    bus.handle_link_loss(FailoverTrigger::HealthCritical).await;
                }
            }

            let ping_id = uuid::Uuid::new_v4().to_string();
            bus.health.record_ping_sent(&ping_id, now);
            let _ = link
                .send(Frame::Ping {
                    id: ping_id,
                    sent_at: now,
                })
                .await;
        }
    }

    async fn batch_loop(bus: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if bus.stopped.load(Ordering::SeqCst) {
                break;
            }
            for flush in bus.batcher.due(now_ms()) {
                bus.flush_receipts(flush).await;
            }
        }
    }

    /// Retry dispatcher: drains due outbound entries as backoffs elapse.
    /// Sleeps first — an explicit `process_queue` right after `connect`
    /// owns the initial drain.
    async fn dispatch_loop(bus: Arc<Self>) {
        let period = bus.config.retry_base_ms.clamp(200, 2000);
        loop {
            tokio::time::sleep(Duration::from_millis(period)).await;
            if bus.stopped.load(Ordering::SeqCst) {
                break;
            }
            if bus.is_connected() {
                let _ = bus.process_queue().await;
            }
        }
    }

    async fn auto_sync_loop(bus: Arc<Self>) {
        let period = bus.config.auto_sync_interval_ms.unwrap_or(60_000);
        let mut interval = tokio::time::interval(Duration::from_millis(period));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if bus.stopped.load(Ordering::SeqCst) {
                break;
            }
            // Never while offline, never concurrently with itself
            if !bus.is_connected() {
                continue;
            }
            let sessions = match bus.store.list_sessions() {
                Ok(sessions) => sessions,
                Err(_) => continue,
            };
            for session in sessions {
                if bus.sync_engine.is_inflight(&session.session_id) {
                    continue;
                }
                let _ = bus.sync(&session.session_id).await;
            }
        }
    }

    async fn health_check_loop(bus: Arc<Self>) {
        let period = if bus.config.health_check_interval_ms > 0 {
            bus.config.health_check_interval_ms
        } else {
            30_000
        };
        let mut interval = tokio::time::interval(Duration::from_millis(period));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if bus.stopped.load(Ordering::SeqCst) {
                break;
            }
            let healthy = bus
                .directory
                .health_check_all(
                    bus.connector.as_ref(),
                    Duration::from_millis(bus.config.connection_timeout_ms),
                )
                .await;
            debug!(healthy, "directory health sweep finished");
        }
    }

    async fn handle_link_loss(self: &Arc<Self>, trigger: FailoverTrigger) {
        let old = self.primary_link();
        let started = Instant::now();

        match self.failover.run(old, trigger).await {
            Ok((link, report)) => {
                if report.elapsed_ms > self.config.failover_threshold_ms {
                    warn!(
                        elapsed_ms = report.elapsed_ms,
                        threshold_ms = self.config.failover_threshold_ms,
                        "failover exceeded its time budget"
                    );
                }
                let endpoint_id = link.endpoint_id();
                *self.primary.write() = Some(link);
                self.health.reset(&endpoint_id, now_ms());
                self.breaker.lock().record_success();
                self.metrics.incr_failover_count();
                self.metrics
                    .record_timing(TimedOp::Failover, started.elapsed().as_millis() as u64);
                self.events.emit(CoreEvent::ConnectionChanged {
                    endpoint_id,
                    state: LinkState::Connected,
                });
                self.events.emit(CoreEvent::FailoverCompleted(report));
            }
            Err(relay::FailoverError::AlreadyRunning) => {
                // Another trigger is mid-failover; let it finish
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                warn!(error = %e, "failover unsuccessful, going offline");
                *self.primary.write() = None;
                self.events.emit(CoreEvent::ConnectionChanged {
                    endpoint_id: String::new(),
                    state: LinkState::Failed,
                });
                tokio::time::sleep(Duration::from_millis(
                    self.config.failover_cooldown_ms.min(1000),
                ))
                .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_frame(self: &Arc<Self>, frame: Frame, link: &Arc<dyn Link>) {
        self.health.record_frame();

        match frame {
            Frame::Chat { message, .. } => self.handle_chat(message).await,
            Frame::Ack { ref_id, status } => self.handle_ack(&ref_id, status).await,
            Frame::ReadReceiptBatch { receipts, .. } => {
                for receipt in receipts {
                    let status = MessageStatus::from(receipt.status);
                    if let Err(e) = self.apply_status(&receipt.message_id, status) {
                        debug!(message_id = %receipt.message_id, error = %e, "receipt skipped");
                    }
                }
            }
            Frame::StatusUpdate {
                message_id, status, ..
            } => {
                if let Err(e) = self.apply_status(&message_id, status) {
                    debug!(message_id = %message_id, error = %e, "status update skipped");
                }
            }
            Frame::ReactionEvent {
                message_id,
                session_id,
                reactor,
                emoji,
                op,
                at,
            } => {
                let add = op == message::ReactionOp::Add;
                match self
                    .reactions
                    .apply_remote(&message_id, &reactor, &emoji, add, at)
                {
                    Ok(true) => self.events.emit(CoreEvent::ReactionChanged {
                        message_id,
                        session_id,
                        reactor,
                        emoji,
                        added: add,
                    }),
                    Ok(false) => {}
                    Err(e) => self.protocol_violation(format!("bad reaction event: {}", e)),
                }
            }
            Frame::SyncRequest {
                session_id,
                since_vc,
            } => match self.sync_engine.serve(&session_id, &since_vc) {
                Ok((messages, server_vc)) => {
                    let _ = link
                        .send(Frame::SyncResponse {
                            session_id,
                            messages,
                            server_vc,
                        })
                        .await;
                }
                Err(e) => debug!(error = %e, "sync request not served"),
            },
            Frame::SyncResponse {
                session_id,
                messages,
                server_vc,
            } => match self.sync_engine.apply_response(&session_id, messages, server_vc) {
                Ok(stats) => {
                    self.events.emit(CoreEvent::SyncCompleted(stats.clone()));
                    if let Some(tx) = self.pending_syncs.lock().remove(&session_id) {
                        let _ = tx.send(stats);
                    }
                }
                Err(e) => {
                    self.sync_engine.abort(&session_id);
                    self.pending_syncs.lock().remove(&session_id);
                    warn!(error = %e, "sync response rejected");
                }
            },
            Frame::Ping { id, sent_at } => {
                let _ = link.send(Frame::Pong { id, sent_at }).await;
            }
            Frame::Pong { id, .. } => {
                self.health.record_pong(&id, now_ms());
            }
            Frame::Handshake { .. } => {
                // Server-side frame; a relay never sends us one
            }
            Frame::HandshakeResponse { success, error, .. } => {
                if !success {
                    self.protocol_violation(format!(
                        "handshake rejected: {}",
                        error.unwrap_or_default()
                    ));
                }
            }
            Frame::Disconnect { reason } => {
                warn!(reason, "relay asked to disconnect");
                self.handle_link_loss(FailoverTrigger::TransportClosed).await;
            }
            Frame::Unknown { frame_type, .. } => {
                self.protocol_violation(format!("unknown frame type: {}", frame_type));
            }
        }
    }

    async fn handle_chat(self: &Arc<Self>, wire: WireMessage) {
        self.metrics.incr_messages_received();

        let msg = match wire.into_message(MessageStatus::Delivered) {
            Ok(msg) => msg,
            Err(e) => {
                self.protocol_violation(format!("undecodable chat: {}", e));
                return;
            }
        };

        let plaintext = if self.config.enable_encryption {
            match self.cipher.decrypt(&msg.session_id, &msg.ciphertext) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    // Decrypt failures never halt the stream
                    self.metrics.incr_decrypt_failures();
                    self.protocol_violation(format!("decrypt failure for {}: {}", msg.id, e));
                    return;
                }
            }
        } else {
            msg.ciphertext.clone()
        };

        match self.store.insert_remote(&msg) {
            Ok(true) => {}
            Ok(false) => return, // duplicate
            Err(e) => {
                warn!(message_id = %msg.id, error = %e, "incoming message not stored");
                return;
            }
        }

        let session_id = msg.session_id.clone();
        let message_id = msg.id.clone();
        let deliverables = {
            let mut reorder = self.reorder.lock();
            let buffer = reorder
                .entry(session_id.clone())
                .or_insert_with(|| {
                    CausalBuffer::new(&session_id, &self.config.device_id, self.config.reorder_window)
                });
            buffer.offer(msg, plaintext)
        };
        for item in deliverables {
            self.events.emit(CoreEvent::MessageReceived {
                message: item.message,
                plaintext: item.plaintext,
            });
        }

        self.send_delivered_receipt(&session_id, &message_id).await;
    }

    async fn handle_ack(&self, ref_id: &str, status: AckStatus) {
        let now = now_ms();
        match status {
            AckStatus::Delivered => {
                // Relay custody: the message is Sent; the entry lingers
                // until the peer acknowledges delivery.
                self.breaker.lock().record_success();
                match self.store.update_status(ref_id, MessageStatus::Sent) {
                    Ok(true) => {
                        if let Ok(Some(msg)) = self.store.get_message(ref_id) {
                            self.emit_status(&msg.session_id, ref_id, MessageStatus::Sent);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => debug!(message_id = %ref_id, error = %e, "ack transition skipped"),
                }
                let _ = self
                    .outbox
                    .defer(ref_id, now + self.config.retry_max_ms);
            }
            AckStatus::Failed | AckStatus::Expired | AckStatus::Rejected => {
                let attempts = match self.outbox.record_attempt(
                    ref_id,
                    self.config.retry_base_ms,
                    self.config.retry_max_ms,
                    now,
                ) {
                    Ok(attempts) => attempts,
                    Err(_) => return,
                };
                if attempts >= self.config.retry_attempts {
                    let _ = self.outbox.remove(ref_id);
                    if self
                        .store
                        .update_status(ref_id, MessageStatus::Failed)
                        .unwrap_or(false)
                    {
                        if let Ok(Some(msg)) = self.store.get_message(ref_id) {
                            self.emit_status(&msg.session_id, ref_id, MessageStatus::Failed);
                        }
                    }
                }
            }
        }
    }

    fn protocol_violation(&self, detail: String) {
        self.metrics.incr_protocol_violations();
        debug!(detail = %detail, "protocol violation");
        self.events.emit(CoreEvent::ProtocolViolation { detail });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(fill: u8) -> String {
        bs58::encode([fill; 32]).into_string()
    }

    fn test_config(relay_ids: &[&str]) -> CoreConfig {
        CoreConfig {
            device_id: "dev1".into(),
            relay_endpoints: relay_ids
                .iter()
                .map(|id| RelayEndpoint::new(id, &format!("mem://{}", id), "local", 1))
                .collect(),
            selection_strategy: SelectionStrategy::RoundRobin,
            ..CoreConfig::default()
        }
    }

    fn offline_bus() -> Arc<MessageBus> {
        let relay = MemoryRelay::new("r1");
        relay.kill();
        MessageBus::init_with_connector(
            test_config(&["r1"]),
            &wallet(9),
            Arc::new(MemoryConnector::new(vec![relay])),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_validations() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();

        let err = bus.send(&session.session_id, "").await.unwrap_err();
        assert_eq!(err.code, "EMPTY_MESSAGE");

        let big = "x".repeat(10 * 1024 + 1);
        let err = bus.send(&session.session_id, &big).await.unwrap_err();
        assert_eq!(err.code, "MESSAGE_TOO_LARGE");

        let err = bus.send("nope", "hello").await.unwrap_err();
        assert_eq!(err.code, "UNKNOWN_SESSION");
    }

    #[tokio::test]
    async fn test_send_offline_persists_as_queued() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();

        let receipt = bus.send(&session.session_id, "hello").await.unwrap();
        assert_eq!(receipt.status, MessageStatus::Queued);
        assert_eq!(bus.status(&receipt.message_id).unwrap(), MessageStatus::Queued);

        // Durable before any network attempt: ciphertext only
        let stored = bus.stored_messages(&session.session_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0].ciphertext, b"hello");
        assert_eq!(stored[0].vector_clock.get("dev1"), 1);
    }

    #[tokio::test]
    async fn test_start_session_is_idempotent_per_peer() {
        let bus = offline_bus();
        let a = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        let b = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(bus.sessions().unwrap().len(), 1);

        bus.start_session(&wallet(2), &[8u8; 32]).unwrap();
        assert_eq!(bus.sessions().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_start_session_rejects_bad_identity() {
        let bus = offline_bus();
        let err = bus.start_session("not-a-wallet", &[7u8; 32]).unwrap_err();
        assert_eq!(err.code, "INVALID_IDENTITY");
    }

    #[tokio::test]
    async fn test_ops_fail_after_disconnect() {
        let bus = offline_bus();
        bus.disconnect().await.unwrap();

        assert_eq!(
            bus.start_session(&wallet(1), &[7u8; 32]).unwrap_err().code,
            "NOT_READY"
        );
        assert_eq!(bus.send("s", "x").await.unwrap_err().code, "NOT_READY");
        assert_eq!(bus.export().unwrap_err().code, "NOT_READY");
    }

    #[tokio::test]
    async fn test_process_queue_offline_errors() {
        let bus = offline_bus();
        let err = bus.process_queue().await.unwrap_err();
        assert_eq!(err.code, "OFFLINE");
    }

    #[tokio::test]
    async fn test_sync_offline_errors() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        let err = bus.sync(&session.session_id).await.unwrap_err();
        assert_eq!(err.code, "OFFLINE");
    }

    #[tokio::test]
    async fn test_clock_advances_across_sends() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();

        bus.send(&session.session_id, "one").await.unwrap();
        bus.send(&session.session_id, "two").await.unwrap();
        bus.send(&session.session_id, "three").await.unwrap();

        let stored = bus.stored_messages(&session.session_id).unwrap();
        let counters: Vec<u64> = stored.iter().map(|m| m.vector_clock.get("dev1")).collect();
        assert_eq!(counters, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_export_import_moves_state() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        bus.send(&session.session_id, "carry me").await.unwrap();

        let blob = bus.export().unwrap();

        let other = offline_bus();
        let imported = other.import(&blob).unwrap();
        assert!(imported > 0);
        assert_eq!(other.stored_messages(&session.session_id).unwrap().len(), 1);

        let err = other.import(&vec![0u8; 11 * 1024 * 1024]).unwrap_err();
        assert_eq!(err.code, "BLOB_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_update_status_releases_outbox_entry() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        let receipt = bus.send(&session.session_id, "hello").await.unwrap();
        assert_eq!(bus.metrics().queue_depth, 1);

        bus.update_status(&receipt.message_id, MessageStatus::Delivered)
            .unwrap();
        // The entry is released once the message is delivered
        assert_eq!(
            bus.stored_messages(&session.session_id).unwrap()[0].status,
            MessageStatus::Delivered
        );

        let err = bus
            .update_status(&receipt.message_id, MessageStatus::Sent)
            .unwrap_err();
        assert_eq!(err.code, "ILLEGAL_TRANSITION");
    }

    #[tokio::test]
    async fn test_batch_update_status_skips_illegal() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        let r1 = bus.send(&session.session_id, "one").await.unwrap();
        let r2 = bus.send(&session.session_id, "two").await.unwrap();

        bus.update_status(&r2.message_id, MessageStatus::Read).unwrap();
        let changed = bus
            .batch_update_status(&[
                (r1.message_id.clone(), MessageStatus::Sent),
                (r2.message_id.clone(), MessageStatus::Sent), // regression, skipped
                ("ghost".to_string(), MessageStatus::Sent),   // unknown, skipped
            ])
            .unwrap();
        assert_eq!(changed, 1);
    }

    #[tokio::test]
    async fn test_end_session_clears_state() {
        let bus = offline_bus();
        let session = bus.start_session(&wallet(1), &[7u8; 32]).unwrap();
        bus.send(&session.session_id, "bye").await.unwrap();

        let removed = bus.end_session(&session.session_id).await.unwrap();
        assert_eq!(removed, 1);
        assert!(bus.sessions().unwrap().is_empty());
        assert!(bus.stored_messages(&session.session_id).unwrap().is_empty());
    }
}
