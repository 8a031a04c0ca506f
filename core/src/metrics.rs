// Core observability: counters and coarse per-operation timings

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Operations with exposed timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedOp {
    Send,
    Sync,
    Failover,
    GetStoredMessages,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OpTiming {
    pub count: u64,
    pub total_ms: u64,
    pub last_ms: u64,
}

impl OpTiming {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub failover_count: u64,
    pub queue_depth: u64,
    pub decrypt_failures: u64,
    pub batch_flushes: u64,
    pub protocol_violations: u64,
    pub send: OpTiming,
    pub sync: OpTiming,
    pub failover: OpTiming,
    pub get_stored_messages: OpTiming,
}

#[derive(Default)]
struct Timings {
    send: OpTiming,
    sync: OpTiming,
    failover: OpTiming,
    get_stored_messages: OpTiming,
}

/// Process-wide counters for one core instance
#[derive(Default)]
pub struct CoreMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    failover_count: AtomicU64,
    queue_depth: AtomicU64,
    decrypt_failures: AtomicU64,
    batch_flushes: AtomicU64,
    protocol_violations: AtomicU64,
    timings: Mutex<Timings>,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failover_count(&self) {
        self.failover_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_decrypt_failures(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_batch_flushes(&self) {
        self.batch_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn record_timing(&self, op: TimedOp, elapsed_ms: u64) {
        let mut timings = self.timings.lock();
        let slot = match op {
            TimedOp::Send => &mut timings.send,
            TimedOp::Sync => &mut timings.sync,
            TimedOp::Failover => &mut timings.failover,
            TimedOp::GetStoredMessages => &mut timings.get_stored_messages,
        };
        slot.count += 1;
        slot.total_ms += elapsed_ms;
        slot.last_ms = elapsed_ms;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let timings = self.timings.lock();
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            failover_count: self.failover_count.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            batch_flushes: self.batch_flushes.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            send: timings.send,
            sync: timings.sync,
            failover: timings.failover,
            get_stored_messages: timings.get_stored_messages,
        }
    }
}
