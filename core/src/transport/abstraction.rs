//! Transport abstraction for the messaging core.
//!
//! A `Connector` opens one logical connection (`Link`) to a relay endpoint.
//! Frames sent on a single link are delivered in order; nothing is promised
//! across reconnects.

use crate::message::Frame;
use crate::relay::RelayEndpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnecting => write!(f, "disconnecting"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of a link's frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
}

/// Shared atomic counters backing `LinkStats` snapshots
#[derive(Debug, Default)]
pub struct LinkCounters {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

impl LinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Wire error: {0}")]
    Wire(String),
}

/// One live connection to a relay
#[async_trait]
pub trait Link: Send + Sync + std::fmt::Debug {
    /// Enqueue a frame to the wire; returns once the local buffer accepts it
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Next incoming frame. Errors once the connection is gone — the
    /// sequence is not restartable across disconnects.
    async fn recv(&self) -> Result<Frame, TransportError>;

    /// Graceful close: best-effort disconnect frame, then release
    async fn close(&self, reason: &str) -> Result<(), TransportError>;

    fn state(&self) -> LinkState;
    fn stats(&self) -> LinkStats;

    /// Id of the endpoint this link is connected to
    fn endpoint_id(&self) -> String;
}

/// Opens links. Implementations: WebSocket (reference), in-memory (tests).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &RelayEndpoint,
        timeout: Duration,
    ) -> Result<std::sync::Arc<dyn Link>, TransportError>;
}
