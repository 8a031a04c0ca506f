// Circuit breaker in front of send — fail fast once the primary link has
// accumulated consecutive failures, probe again after a cooldown.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, reject requests until the cooldown elapses
    Open,
    /// Cooldown elapsed, one probe request allowed through
    HalfOpen,
}

/// Consecutive-failure breaker. Time is injected (ms) so the transitions
/// are deterministic under test.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown_ms: u64,
    opened_at: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown_ms,
            opened_at: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a send may proceed right now. Moves Open -> HalfOpen once the
    /// cooldown has elapsed (the caller's request becomes the probe).
    pub fn allow(&mut self, now: u64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if now.saturating_sub(self.opened_at) >= self.cooldown_ms {
                    self.state = CircuitState::HalfOpen;
                    debug!("circuit breaker half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            debug!("circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, now: u64) {
        match self.state {
            CircuitState::HalfOpen => {
                // Probe failed: straight back to Open, restart the cooldown
                self.state = CircuitState::Open;
                self.opened_at = now;
                debug!("circuit breaker probe failed, reopening");
            }
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = now;
                    debug!(
                        failures = self.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}
