// Core configuration — one validated struct, no ambient lookups

use crate::relay::{HealthThresholds, RelayEndpoint, SelectionStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Stable per-install device id; stamped into vector clocks and
    /// message ids
    pub device_id: String,
    /// Known relay endpoints (bootstrap list; discovery may add more)
    pub relay_endpoints: Vec<RelayEndpoint>,
    pub selection_strategy: SelectionStrategy,
    pub preferred_regions: Vec<String>,
    /// None = in-memory store (tests, ephemeral sessions)
    pub storage_path: Option<String>,

    // Connection management
    pub failover_threshold_ms: u64,
    pub connection_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// 0 disables the periodic directory probe
    pub health_check_interval_ms: u64,
    pub health_thresholds: HealthThresholds,
    pub failover_cooldown_ms: u64,

    // Outbound queue
    pub queue_max_size: usize,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub send_timeout_ms: u64,

    // Read receipts
    pub batch_delay_ms: u64,
    pub batch_max_size: usize,
    pub batch_max_retries: u32,

    // Limits
    pub message_max_bytes: usize,
    pub import_max_bytes: usize,

    // Behavior toggles
    pub enable_encryption: bool,
    pub enable_auto_discovery: bool,
    /// None disables auto-sync
    pub auto_sync_interval_ms: Option<u64>,
    pub graceful_disconnect_timeout_ms: u64,

    // Circuit breaker in front of send
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,

    /// Per-session causal reorder window before insertion-order fallback
    pub reorder_window: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            relay_endpoints: Vec::new(),
            selection_strategy: SelectionStrategy::Weighted,
            preferred_regions: Vec::new(),
            storage_path: None,
            failover_threshold_ms: 500,
            connection_timeout_ms: 5000,
            ping_interval_ms: 10_000,
            ping_timeout_ms: 5000,
            health_check_interval_ms: 0,
            health_thresholds: HealthThresholds::default(),
            failover_cooldown_ms: 5000,
            queue_max_size: 1000,
            retry_attempts: 5,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            send_timeout_ms: 5000,
            batch_delay_ms: 500,
            batch_max_size: 50,
            batch_max_retries: 3,
            message_max_bytes: 10 * 1024,
            import_max_bytes: 10 * 1024 * 1024,
            enable_encryption: true,
            enable_auto_discovery: false,
            auto_sync_interval_ms: None,
            graceful_disconnect_timeout_ms: 1000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
            reorder_window: 64,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid("device_id must be set".to_string()));
        }
        if self.relay_endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one relay endpoint is required".to_string(),
            ));
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::Invalid(
                "queue_max_size must be positive".to_string(),
            ));
        }
        if self.message_max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "message_max_bytes must be positive".to_string(),
            ));
        }
        if self.batch_max_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_max_size must be positive".to_string(),
            ));
        }
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid(
                "retry backoff window is inverted".to_string(),
            ));
        }
        Ok(())
    }
}
