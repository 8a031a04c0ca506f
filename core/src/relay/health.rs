//! Per-connection health tracking.
//!
//! The metric core is pure — callers feed it pings, pongs, frames, and
//! errors with explicit timestamps, and read back smoothed metrics plus
//! threshold alerts. The async ping loop lives with the bus; it only calls
//! into this module.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Smoothing factor for the latency EWMA
const LATENCY_ALPHA: f64 = 0.3;

/// Clean pings needed before stability saturates
const STABILITY_PING_TARGET: f64 = 10.0;

/// Connection age (seconds) before stability saturates
const STABILITY_AGE_TARGET_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LatencyBreach,
    ThroughputBreach,
    ErrorRateBreach,
    StabilityBreach,
    UptimeBreach,
    PingTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold breach on a live connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub endpoint_id: String,
    pub value: f64,
    pub threshold: f64,
}

/// Configurable breach thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub max_latency_ms: f64,
    pub min_throughput_fps: f64,
    pub max_error_rate: f64,
    pub min_stability: f64,
    pub min_uptime_secs: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: 1000.0,
            min_throughput_fps: 0.0,
            max_error_rate: 0.25,
            min_stability: 0.2,
            min_uptime_secs: 0.0,
        }
    }
}

/// Point-in-time view of a connection's rolling metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub endpoint_id: String,
    pub latency_ms: Option<f64>,
    pub throughput_fps: f64,
    pub error_rate: f64,
    pub stability: f64,
    pub uptime_secs: f64,
    pub consecutive_clean_pings: u32,
}

struct ConnectionHealth {
    endpoint_id: String,
    started_at: u64,
    ewma_latency_ms: Option<f64>,
    frames_total: u64,
    errors: u64,
    consecutive_clean_pings: u32,
    pending_pings: HashMap<String, u64>,
}

impl ConnectionHealth {
    fn new(endpoint_id: String, now: u64) -> Self {
        Self {
            endpoint_id,
            started_at: now,
            ewma_latency_ms: None,
            frames_total: 0,
            errors: 0,
            consecutive_clean_pings: 0,
            pending_pings: HashMap::new(),
        }
    }

    fn stability(&self, now: u64) -> f64 {
        let ping_factor =
            (self.consecutive_clean_pings as f64 / STABILITY_PING_TARGET).min(1.0);
        let age_secs = now.saturating_sub(self.started_at) as f64 / 1000.0;
        let age_factor = (age_secs / STABILITY_AGE_TARGET_SECS).min(1.0);
        // Young connections cap out low even with clean pings
        ping_factor * 0.7 + age_factor * 0.3
    }

    fn snapshot(&self, now: u64) -> HealthSnapshot {
        let uptime_secs = now.saturating_sub(self.started_at) as f64 / 1000.0;
        let throughput_fps = if uptime_secs > 0.0 {
            self.frames_total as f64 / uptime_secs
        } else {
            0.0
        };
        let total_events = self.frames_total + self.errors;
        let error_rate = if total_events > 0 {
            self.errors as f64 / total_events as f64
        } else {
            0.0
        };

        HealthSnapshot {
            endpoint_id: self.endpoint_id.clone(),
            latency_ms: self.ewma_latency_ms,
            throughput_fps,
            error_rate,
            stability: self.stability(now),
            uptime_secs,
            consecutive_clean_pings: self.consecutive_clean_pings,
        }
    }
}

/// Tracks the primary connection's health. Reset on failover.
pub struct HealthMonitor {
    inner: Mutex<ConnectionHealth>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(endpoint_id: &str, thresholds: HealthThresholds, now: u64) -> Self {
        Self {
            inner: Mutex::new(ConnectionHealth::new(endpoint_id.to_string(), now)),
            thresholds,
        }
    }

    /// Point the monitor at a new connection, dropping all history
    pub fn reset(&self, endpoint_id: &str, now: u64) {
        *self.inner.lock() = ConnectionHealth::new(endpoint_id.to_string(), now);
        debug!(endpoint = %endpoint_id, "health monitor reset");
    }

    pub fn endpoint_id(&self) -> String {
        self.inner.lock().endpoint_id.clone()
    }

    pub fn record_ping_sent(&self, ping_id: &str, now: u64) {
        self.inner
            .lock()
            .pending_pings
            .insert(ping_id.to_string(), now);
    }

    /// Resolve a pong against its pending ping. Returns the measured
    /// latency, or None for an unmatched (stale) pong.
    pub fn record_pong(&self, ping_id: &str, now: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let sent_at = inner.pending_pings.remove(ping_id)?;
        let latency = now.saturating_sub(sent_at);

        inner.ewma_latency_ms = Some(match inner.ewma_latency_ms {
            Some(prev) => prev * (1.0 - LATENCY_ALPHA) + latency as f64 * LATENCY_ALPHA,
            None => latency as f64,
        });
        inner.consecutive_clean_pings += 1;
        Some(latency)
    }

    /// Pings outstanding longer than `timeout_ms`. Each is counted as a
    /// latency failure and removed from the pending set.
    pub fn expire_pending_pings(&self, now: u64, timeout_ms: u64) -> Vec<String> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .pending_pings
            .iter()
            .filter(|(_, &sent_at)| now.saturating_sub(sent_at) >= timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            inner.pending_pings.remove(id);
            inner.errors += 1;
            inner.consecutive_clean_pings = 0;
        }
        expired
    }

    pub fn record_frame(&self) {
        self.inner.lock().frames_total += 1;
    }

    pub fn record_error(&self) {
        let mut inner = self.inner.lock();
        inner.errors += 1;
        inner.consecutive_clean_pings = 0;
    }

    pub fn snapshot(&self, now: u64) -> HealthSnapshot {
        self.inner.lock().snapshot(now)
    }

    /// Evaluate the thresholds. Ping timeouts are reported by the caller
    /// (they know the timeout); this covers the rolling metrics.
    pub fn evaluate(&self, now: u64) -> Vec<Alert> {
        let snap = self.snapshot(now);
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        if let Some(latency) = snap.latency_ms {
            if latency > t.max_latency_ms {
                alerts.push(Alert {
                    kind: AlertKind::LatencyBreach,
                    severity: if latency > t.max_latency_ms * 2.0 {
                        AlertSeverity::Critical
                    } else {
                        AlertSeverity::Warning
                    },
                    endpoint_id: snap.endpoint_id.clone(),
                    value: latency,
                    threshold: t.max_latency_ms,
                });
            }
        }

        if snap.throughput_fps < t.min_throughput_fps {
            alerts.push(Alert {
                kind: AlertKind::ThroughputBreach,
                severity: AlertSeverity::Warning,
                endpoint_id: snap.endpoint_id.clone(),
                value: snap.throughput_fps,
                threshold: t.min_throughput_fps,
            });
        }

        if snap.error_rate > t.max_error_rate {
            alerts.push(Alert {
                kind: AlertKind::ErrorRateBreach,
                severity: AlertSeverity::Critical,
                endpoint_id: snap.endpoint_id.clone(),
                value: snap.error_rate,
                threshold: t.max_error_rate,
            });
        }

        if snap.stability < t.min_stability {
            alerts.push(Alert {
                kind: AlertKind::StabilityBreach,
                severity: AlertSeverity::Warning,
                endpoint_id: snap.endpoint_id.clone(),
                value: snap.stability,
                threshold: t.min_stability,
            });
        }

        if snap.uptime_secs < t.min_uptime_secs {
            alerts.push(Alert {
                kind: AlertKind::UptimeBreach,
                severity: AlertSeverity::Warning,
                endpoint_id: snap.endpoint_id.clone(),
                value: snap.uptime_secs,
                threshold: t.min_uptime_secs,
            });
        }

        alerts
    }

    /// Build the critical alert for a ping that never came back
    pub fn ping_timeout_alert(&self, timeout_ms: u64) -> Alert {
        Alert {
            kind: AlertKind::PingTimeout,
            severity: AlertSeverity::Critical,
            endpoint_id: self.endpoint_id(),
            value: timeout_ms as f64,
            threshold: timeout_ms as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new("r1", HealthThresholds::default(), 0)
    }

    #[test]
    fn test_pong_resolves_latency() {
        let m = monitor();
        m.record_ping_sent("p1", 1000);
        let latency = m.record_pong("p1", 1080).unwrap();
        assert_eq!(latency, 80);
        assert_eq!(m.snapshot(2000).latency_ms, Some(80.0));
    }

    #[test]
    fn test_latency_is_smoothed() {
        let m = monitor();
        m.record_ping_sent("p1", 0);
        m.record_pong("p1", 100); // ewma = 100
        m.record_ping_sent("p2", 1000);
        m.record_pong("p2", 1200); // ewma = 100*0.7 + 200*0.3 = 130

        let latency = m.snapshot(2000).latency_ms.unwrap();
        assert!((latency - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_pong_is_ignored() {
        let m = monitor();
        assert!(m.record_pong("never-sent", 100).is_none());
        assert_eq!(m.snapshot(200).latency_ms, None);
    }

    #[test]
    fn test_expired_pings_count_as_errors_and_break_streak() {
        let m = monitor();
        m.record_ping_sent("p1", 0);
        m.record_pong("p1", 50);
        assert_eq!(m.snapshot(100).consecutive_clean_pings, 1);

        m.record_ping_sent("p2", 1000);
        let expired = m.expire_pending_pings(6001, 5000);
        assert_eq!(expired, vec!["p2".to_string()]);

        let snap = m.snapshot(6001);
        assert_eq!(snap.consecutive_clean_pings, 0);
        assert!(snap.error_rate > 0.0);

        // Expired pings are removed; a late pong no longer matches
        assert!(m.record_pong("p2", 7000).is_none());
    }

    #[test]
    fn test_throughput_and_error_rate() {
        let m = monitor();
        for _ in 0..20 {
            m.record_frame();
        }
        m.record_error();

        let snap = m.snapshot(10_000); // 10s uptime
        assert!((snap.throughput_fps - 2.0).abs() < 1e-9);
        assert!((snap.error_rate - 1.0 / 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_stability_grows_with_clean_pings_and_age() {
        let m = monitor();
        let young = m.snapshot(1000).stability;

        for i in 0..10 {
            let id = format!("p{}", i);
            m.record_ping_sent(&id, i * 10_000);
            m.record_pong(&id, i * 10_000 + 50);
        }
        let seasoned = m.snapshot(100_000).stability;
        assert!(seasoned > young);
        assert!((seasoned - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_breach_alert_severity() {
        let m = monitor();
        m.record_ping_sent("p1", 0);
        m.record_pong("p1", 1500);
        let alerts = m.evaluate(2000);
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::LatencyBreach && a.severity == AlertSeverity::Warning));

        m.record_ping_sent("p2", 10_000);
        m.record_pong("p2", 40_000); // drives ewma way past 2x threshold
        m.record_ping_sent("p3", 50_000);
        m.record_pong("p3", 80_000);
        let alerts = m.evaluate(90_000);
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::LatencyBreach && a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn test_error_rate_breach_is_critical() {
        let m = monitor();
        m.record_frame();
        m.record_error();
        let alerts = m.evaluate(1000);
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::ErrorRateBreach && a.severity == AlertSeverity::Critical));
    }

    #[test]
    fn test_reset_drops_history() {
        let m = monitor();
        m.record_ping_sent("p1", 0);
        m.record_pong("p1", 100);
        m.record_error();

        m.reset("r2", 5000);
        let snap = m.snapshot(6000);
        assert_eq!(snap.endpoint_id, "r2");
        assert_eq!(snap.latency_ms, None);
        assert_eq!(snap.error_rate, 0.0);
    }
}
