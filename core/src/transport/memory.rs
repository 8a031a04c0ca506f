// In-process transport — a channel-pair link plus a scriptable relay.
//
// This is the transport the test suite runs on: the relay auto-acks chat
// frames, answers pings and handshakes, records every frame it sees, and
// can be killed mid-flight to force a failover. No sockets involved.

use super::abstraction::{Connector, Link, LinkCounters, LinkState, LinkStats, TransportError};
use crate::message::{now_ms, AckStatus, Frame};
use crate::relay::RelayEndpoint;
use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;

/// Client side of an in-process connection
#[derive(Debug)]
pub struct MemoryLink {
    endpoint_id: String,
    to_relay: mpsc::UnboundedSender<Frame>,
    from_relay: Mutex<mpsc::UnboundedReceiver<Frame>>,
    state: RwLock<LinkState>,
    counters: LinkCounters,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.state() != LinkState::Connected {
            return Err(TransportError::Closed("link not connected".to_string()));
        }
        self.to_relay.send(frame).map_err(|_| {
            self.counters.record_error();
            *self.state.write() = LinkState::Failed;
            TransportError::SendFailed("relay gone".to_string())
        })?;
        self.counters.record_sent();
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut rx = self.from_relay.lock().await;
        match rx.recv().await {
            Some(frame) => {
                self.counters.record_received();
                Ok(frame)
            }
            None => {
                *self.state.write() = LinkState::Disconnected;
                Err(TransportError::Closed("relay closed".to_string()))
            }
        }
    }

    async fn close(&self, reason: &str) -> Result<(), TransportError> {
        *self.state.write() = LinkState::Disconnecting;
        let _ = self.to_relay.send(Frame::Disconnect {
            reason: reason.to_string(),
        });
        *self.state.write() = LinkState::Disconnected;
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    fn endpoint_id(&self) -> String {
        self.endpoint_id.clone()
    }
}

/// Scriptable in-process relay. Frames from one client are forwarded to
/// every other connected client, the way a real relay fans traffic out to
/// the peer's device.
pub struct MemoryRelay {
    endpoint_id: String,
    alive: AtomicBool,
    auto_ack: AtomicBool,
    forward: AtomicBool,
    ack_status: SyncMutex<AckStatus>,
    seen: SyncMutex<Vec<Frame>>,
    clients: SyncMutex<Vec<(u64, mpsc::UnboundedSender<Frame>)>>,
    next_client: AtomicU64,
    connect_count: AtomicU64,
    kill_signal: Notify,
}

impl MemoryRelay {
    pub fn new(endpoint_id: &str) -> Arc<Self> {
        Arc::new(Self {
            endpoint_id: endpoint_id.to_string(),
            alive: AtomicBool::new(true),
            auto_ack: AtomicBool::new(true),
            forward: AtomicBool::new(true),
            ack_status: SyncMutex::new(AckStatus::Delivered),
            seen: SyncMutex::new(Vec::new()),
            clients: SyncMutex::new(Vec::new()),
            next_client: AtomicU64::new(0),
            connect_count: AtomicU64::new(0),
            kill_signal: Notify::new(),
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop accepting connections and drop every live link
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.clients.lock().clear();
        self.kill_signal.notify_waiters();
        debug!(relay = %self.endpoint_id, "memory relay killed");
    }

    pub fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Disable chat auto-acks (frames are still recorded)
    pub fn set_auto_ack(&self, on: bool) {
        self.auto_ack.store(on, Ordering::SeqCst);
    }

    /// Disable client-to-client forwarding (single-client tests)
    pub fn set_forwarding(&self, on: bool) {
        self.forward.store(on, Ordering::SeqCst);
    }

    /// Status used when auto-acking chats
    pub fn set_ack_status(&self, status: AckStatus) {
        *self.ack_status.lock() = status;
    }

    /// Every frame this relay has received, in arrival order
    pub fn frames_seen(&self) -> Vec<Frame> {
        self.seen.lock().clone()
    }

    pub fn frames_seen_of_type(&self, frame_type: &str) -> Vec<Frame> {
        self.seen
            .lock()
            .iter()
            .filter(|f| f.frame_type() == frame_type)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Push a frame to every connected client (simulates peer traffic)
    pub fn inject(&self, frame: Frame) {
        let clients = self.clients.lock();
        for (_, client) in clients.iter() {
            let _ = client.send(frame.clone());
        }
    }

    /// Deliver a frame to every client except the originator
    fn forward_to_peers(&self, from_client: u64, frame: &Frame) {
        if !self.forward.load(Ordering::SeqCst) {
            return;
        }
        let clients = self.clients.lock();
        for (id, client) in clients.iter() {
            if *id != from_client {
                let _ = client.send(frame.clone());
            }
        }
    }

    fn spawn_session(
        self: &Arc<Self>,
        client_id: u64,
        mut from_client: mpsc::UnboundedReceiver<Frame>,
        to_client: mpsc::UnboundedSender<Frame>,
    ) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = relay.kill_signal.notified() => break,
                    frame = from_client.recv() => {
                        let Some(frame) = frame else { break };
                        if !relay.handle_frame(client_id, frame, &to_client) {
                            break;
                        }
                    }
                }
            }
            relay.clients.lock().retain(|(id, _)| *id != client_id);
        });
    }

    /// Returns false when the session should end
    fn handle_frame(
        &self,
        client_id: u64,
        frame: Frame,
        to_client: &mpsc::UnboundedSender<Frame>,
    ) -> bool {
        self.seen.lock().push(frame.clone());

        match &frame {
            Frame::Ping { id, sent_at } => {
                let _ = to_client.send(Frame::Pong {
                    id: id.clone(),
                    sent_at: *sent_at,
                });
            }
            Frame::Handshake { .. } => {
                let _ = to_client.send(Frame::HandshakeResponse {
                    success: true,
                    error: None,
                    ts: now_ms(),
                });
            }
            Frame::Chat { message, .. } => {
                if self.auto_ack.load(Ordering::SeqCst) {
                    let _ = to_client.send(Frame::Ack {
                        ref_id: message.id.clone(),
                        status: *self.ack_status.lock(),
                    });
                }
                self.forward_to_peers(client_id, &frame);
            }
            Frame::ReadReceiptBatch { .. }
            | Frame::StatusUpdate { .. }
            | Frame::ReactionEvent { .. }
            | Frame::SyncRequest { .. }
            | Frame::SyncResponse { .. } => {
                self.forward_to_peers(client_id, &frame);
            }
            Frame::Disconnect { .. } => return false,
            _ => {}
        }
        true
    }
}

/// Connector over a fixed set of in-process relays
pub struct MemoryConnector {
    relays: HashMap<String, Arc<MemoryRelay>>,
}

impl MemoryConnector {
    pub fn new(relays: Vec<Arc<MemoryRelay>>) -> Self {
        Self {
            relays: relays
                .into_iter()
                .map(|r| (r.endpoint_id.clone(), r))
                .collect(),
        }
    }

    pub fn relay(&self, endpoint_id: &str) -> Option<&Arc<MemoryRelay>> {
        self.relays.get(endpoint_id)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &RelayEndpoint,
        _timeout: Duration,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let relay = self
            .relays
            .get(&endpoint.id)
            .ok_or_else(|| TransportError::Refused(format!("unknown relay {}", endpoint.id)))?;

        if !relay.is_alive() {
            return Err(TransportError::Refused(format!(
                "relay {} not accepting connections",
                endpoint.id
            )));
        }

        let (client_tx, relay_rx) = mpsc::unbounded_channel();
        let (relay_tx, client_rx) = mpsc::unbounded_channel();

        let client_id = relay.next_client.fetch_add(1, Ordering::SeqCst);
        relay.clients.lock().push((client_id, relay_tx.clone()));
        relay.connect_count.fetch_add(1, Ordering::SeqCst);
        relay.spawn_session(client_id, relay_rx, relay_tx);

        Ok(Arc::new(MemoryLink {
            endpoint_id: endpoint.id.clone(),
            to_relay: client_tx,
            from_relay: Mutex::new(client_rx),
            state: RwLock::new(LinkState::Connected),
            counters: LinkCounters::new(),
        }))
    }
}
