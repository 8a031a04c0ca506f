// Relay catalog, connection health, and failover orchestration

pub mod directory;
pub mod failover;
pub mod health;

pub use directory::{DirectoryError, RelayDirectory, RelayEndpoint, SelectionStrategy};
pub use failover::{FailoverEngine, FailoverError, FailoverPhase, FailoverReport, FailoverTrigger};
pub use health::{
    Alert, AlertKind, AlertSeverity, HealthMonitor, HealthSnapshot, HealthThresholds,
};
