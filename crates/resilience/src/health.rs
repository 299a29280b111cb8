//! Read-only health reporting for one executor key

use serde::Serialize;

use crate::core::CounterSnapshot;
use crate::patterns::circuit_breaker::CircuitState;
use crate::patterns::retry::RetryBudgetStats;

/// Calls refused before the operation ran, by the guard that refused them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionCounts {
    /// Refused by the rate limiter
    pub rate_limited: u64,
    /// Refused by the bulkhead (queue full, queue timeout, closed)
    pub bulkhead: u64,
    /// Refused by the circuit breaker
    pub circuit_open: u64,
}

impl RejectionCounts {
    /// Sum over all guards
    #[must_use]
    pub fn total(&self) -> u64 {
        self.rate_limited + self.bulkhead + self.circuit_open
    }
}

/// Point-in-time view of the guards protecting one key.
///
/// Taking a snapshot never changes limiter, breaker or bulkhead state, and
/// never creates state for a key that has not been used.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Executor key
    pub key: String,
    /// Circuit breaker state
    pub circuit_state: CircuitState,
    /// Operations holding a bulkhead slot
    pub running: usize,
    /// Callers waiting for a bulkhead slot
    pub queued: usize,
    /// Requests the rate limiter would admit right now
    pub tokens_remaining: u64,
    /// Rejections by guard
    pub rejections: RejectionCounts,
    /// Circuit breaker outcome counters
    pub circuit_breaker: CounterSnapshot,
    /// Bulkhead outcome counters
    pub bulkhead: CounterSnapshot,
    /// Executor-wide retry budget usage
    pub retry_budget: RetryBudgetStats,
}

impl HealthSnapshot {
    /// Whether the breaker is letting calls through normally
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.circuit_state == CircuitState::Closed
    }
}
