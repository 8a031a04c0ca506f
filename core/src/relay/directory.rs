//! Relay endpoint catalog — health, latency, quality scores, and the
//! selection strategies that pick where the next connection goes.

use crate::message::{now_ms, Frame};
use crate::transport::{Connector, TransportError};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One relay server the core can connect to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub id: String,
    pub url: String,
    pub region: String,
    /// Operator-assigned tier; lower is more preferred at equal score
    pub priority: u32,
    pub max_connections: u32,
    pub current_connections: u32,
    pub is_healthy: bool,
    /// 0-100, derived from latency and load
    pub quality_score: u8,
    pub latency_ms: u32,
    pub last_health_check: u64,
}

impl RelayEndpoint {
    pub fn new(id: &str, url: &str, region: &str, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            region: region.to_string(),
            priority,
            max_connections: 256,
            current_connections: 0,
            is_healthy: true,
            quality_score: 100,
            latency_ms: 0,
            last_health_check: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.current_connections < self.max_connections
    }
}

/// How `select` picks among healthy endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Stateful rotation over healthy relays
    RoundRobin,
    /// Fewest current connections wins
    LeastConnections,
    /// Sampling with probability proportional to quality score
    Weighted,
    /// Preferred regions first, then lowest latency
    Geographic,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("No healthy relays available")]
    NoHealthyRelays,
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),
}

/// Latency-banded quality score: 100 minus latency and load penalties, plus
/// a bonus for high-capacity relays, clamped to [0, 100].
pub fn compute_quality(latency_ms: u32, current_connections: u32, max_connections: u32) -> u8 {
    let latency_penalty: i32 = if latency_ms > 1000 {
        60
    } else if latency_ms > 500 {
        40
    } else if latency_ms > 200 {
        25
    } else if latency_ms > 100 {
        10
    } else {
        0
    };

    let load_ratio = if max_connections == 0 {
        1.0
    } else {
        current_connections as f64 / max_connections as f64
    };
    let load_penalty = (load_ratio * 30.0) as i32;

    let capacity_bonus = if max_connections >= 512 { 5 } else { 0 };

    (100 - latency_penalty - load_penalty + capacity_bonus).clamp(0, 100) as u8
}

/// Read-mostly catalog of relay endpoints. Updates are serialized behind the
/// internal lock; selection works on a snapshot.
pub struct RelayDirectory {
    endpoints: RwLock<Vec<RelayEndpoint>>,
    strategy: SelectionStrategy,
    preferred_regions: Vec<String>,
    rr_cursor: AtomicUsize,
}

impl RelayDirectory {
    pub fn new(
        endpoints: Vec<RelayEndpoint>,
        strategy: SelectionStrategy,
        preferred_regions: Vec<String>,
    ) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
            strategy,
            preferred_regions,
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// Merge a discovered endpoint into the catalog (bootstrap list, peer
    /// gossip). Known ids keep their health state, only addressing updates.
    pub fn add_endpoint(&self, endpoint: RelayEndpoint) {
        let mut endpoints = self.endpoints.write();
        if let Some(existing) = endpoints.iter_mut().find(|e| e.id == endpoint.id) {
            existing.url = endpoint.url;
            existing.region = endpoint.region;
            existing.priority = endpoint.priority;
            existing.max_connections = endpoint.max_connections;
        } else {
            debug!(relay = %endpoint.id, "discovered new relay endpoint");
            endpoints.push(endpoint);
        }
    }

    pub fn endpoints(&self) -> Vec<RelayEndpoint> {
        self.endpoints.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<RelayEndpoint> {
        self.endpoints.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn mark_unhealthy(&self, id: &str) {
        let mut endpoints = self.endpoints.write();
        if let Some(e) = endpoints.iter_mut().find(|e| e.id == id) {
            e.is_healthy = false;
            e.last_health_check = now_ms();
            warn!(relay = %id, "relay marked unhealthy");
        }
    }

    /// Record a successful probe: sets latency, recomputes quality, and
    /// marks the endpoint healthy again.
    pub fn record_probe(&self, id: &str, latency_ms: u32) {
        let mut endpoints = self.endpoints.write();
        if let Some(e) = endpoints.iter_mut().find(|ep| ep.id == id) {
            e.latency_ms = latency_ms;
            e.is_healthy = true;
            e.last_health_check = now_ms();
            e.quality_score = compute_quality(latency_ms, e.current_connections, e.max_connections);
        }
    }

    /// Track a connection opened (+1) or closed (-1) against an endpoint
    pub fn note_connection(&self, id: &str, opened: bool) {
        let mut endpoints = self.endpoints.write();
        if let Some(e) = endpoints.iter_mut().find(|ep| ep.id == id) {
            if opened {
                e.current_connections = e.current_connections.saturating_add(1);
            } else {
                e.current_connections = e.current_connections.saturating_sub(1);
            }
            e.quality_score = compute_quality(e.latency_ms, e.current_connections, e.max_connections);
        }
    }

    /// Pick an endpoint per the configured strategy
    pub fn select(&self) -> Result<RelayEndpoint, DirectoryError> {
        self.select_excluding(&[])
    }

    /// Pick an endpoint, skipping the given ids (e.g. a failing primary)
    pub fn select_excluding(&self, excluded: &[&str]) -> Result<RelayEndpoint, DirectoryError> {
        let candidates: Vec<RelayEndpoint> = self
            .endpoints
            .read()
            .iter()
            .filter(|e| e.is_healthy && e.has_capacity() && !excluded.contains(&e.id.as_str()))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(DirectoryError::NoHealthyRelays);
        }

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                candidates[cursor % candidates.len()].clone()
            }
            SelectionStrategy::LeastConnections => candidates
                .iter()
                .min_by_key(|e| e.current_connections)
                .cloned()
                .expect("candidates checked non-empty"),
            SelectionStrategy::Weighted => Self::weighted_pick(&candidates),
            SelectionStrategy::Geographic => self.geographic_pick(&candidates),
        };

        debug!(relay = %chosen.id, strategy = ?self.strategy, "selected relay");
        Ok(chosen)
    }

    fn weighted_pick(candidates: &[RelayEndpoint]) -> RelayEndpoint {
        let total: u32 = candidates.iter().map(|e| e.quality_score as u32).sum();
        if total == 0 {
            // All scores zero: fall back to lowest latency
            return candidates
                .iter()
                .min_by_key(|e| e.latency_ms)
                .cloned()
                .expect("candidates checked non-empty");
        }

        let mut roll = rand::thread_rng().gen_range(0..total);
        for endpoint in candidates {
            let weight = endpoint.quality_score as u32;
            if roll < weight {
                // Ties among equal scores break toward lower latency
                let best_tie = candidates
                    .iter()
                    .filter(|e| e.quality_score == endpoint.quality_score)
                    .min_by_key(|e| e.latency_ms)
                    .expect("tie set contains endpoint");
                return best_tie.clone();
            }
            roll -= weight;
        }
        candidates[candidates.len() - 1].clone()
    }

    fn geographic_pick(&self, candidates: &[RelayEndpoint]) -> RelayEndpoint {
        for region in &self.preferred_regions {
            if let Some(best) = candidates
                .iter()
                .filter(|e| &e.region == region)
                .min_by_key(|e| e.latency_ms)
            {
                return best.clone();
            }
        }
        candidates
            .iter()
            .min_by_key(|e| e.latency_ms)
            .cloned()
            .expect("candidates checked non-empty")
    }

    /// Probe one endpoint: connect, exchange a ping, close. Updates latency,
    /// quality, and health in the catalog.
    pub async fn health_check_endpoint(
        &self,
        connector: &dyn Connector,
        id: &str,
        timeout: Duration,
    ) -> Result<u32, DirectoryError> {
        let endpoint = self.get(id).ok_or_else(|| DirectoryError::UnknownRelay(id.to_string()))?;

        match probe(connector, &endpoint, timeout).await {
            Ok(latency_ms) => {
                self.record_probe(id, latency_ms);
                Ok(latency_ms)
            }
            Err(e) => {
                warn!(relay = %id, error = %e, "health probe failed");
                self.mark_unhealthy(id);
                Err(DirectoryError::NoHealthyRelays)
            }
        }
    }

    /// Probe every endpoint. Returns how many are healthy afterwards.
    pub async fn health_check_all(
        &self,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> usize {
        let ids: Vec<String> = self.endpoints.read().iter().map(|e| e.id.clone()).collect();
        for id in ids {
            let _ = self.health_check_endpoint(connector, &id, timeout).await;
        }
        self.endpoints.read().iter().filter(|e| e.is_healthy).count()
    }
}

async fn probe(
    connector: &dyn Connector,
    endpoint: &RelayEndpoint,
    timeout: Duration,
) -> Result<u32, TransportError> {
    let link = connector.connect(endpoint, timeout).await?;
    let ping_id = uuid::Uuid::new_v4().to_string();
    let started = std::time::Instant::now();

    link.send(Frame::Ping {
        id: ping_id.clone(),
        sent_at: now_ms(),
    })
    .await?;

    let latency = loop {
        let frame = tokio::time::timeout(timeout, link.recv())
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        if let Frame::Pong { id, .. } = frame {
            if id == ping_id {
                break started.elapsed().as_millis() as u32;
            }
        }
        // Any other frame (handshake response, stray traffic) is skipped
    };

    let _ = link.close("health check complete").await;
    Ok(latency)
}
