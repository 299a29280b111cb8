//! Circuit breaker for failing-fast on an unhealthy dependency
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     consecutive failures reach `failure_threshold`
//! Open     → HalfOpen: first call at or after `next_retry_at`
//! HalfOpen → Closed:   `success_threshold` trial successes
//! HalfOpen → Open:     any trial failure (restarts the open timeout)
//! ```
//!
//! The breaker only gates whether a call is attempted; it never retries.
//! Every admitted call holds a [`CallPermit`]. A permit that is dropped
//! without an outcome (the caller's future was cancelled) releases its
//! half-open trial slot so the breaker cannot wedge in `HalfOpen`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::core::{
    CallContext, CounterSnapshot, PatternCounters, ResilienceError, TimeoutStage,
    config::{ConfigError, ConfigResult, ResilienceConfig, non_zero_duration},
};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - operations are allowed
    Closed,
    /// Circuit is open - operations are rejected
    Open,
    /// Circuit is half-open - limited trial operations are allowed
    HalfOpen,
}

impl CircuitState {
    const fn to_atomic(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_atomic(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker
    pub success_threshold: u32,
    /// How long the breaker stays open before admitting a trial call
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub open_timeout: Duration,
    /// Concurrent trial calls allowed while half-open; defaults to
    /// `success_threshold`
    pub half_open_max_calls: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set failure threshold
    #[must_use = "builder methods must be chained or built"]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set success threshold
    #[must_use = "builder methods must be chained or built"]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set open timeout
    #[must_use = "builder methods must be chained or built"]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the half-open trial limit
    #[must_use = "builder methods must be chained or built"]
    pub fn with_half_open_max_calls(mut self, limit: u32) -> Self {
        self.half_open_max_calls = Some(limit);
        self
    }

    /// Effective half-open trial limit
    #[must_use]
    pub fn max_trial_calls(&self) -> u32 {
        self.half_open_max_calls.unwrap_or(self.success_threshold)
    }
}

impl ResilienceConfig for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::validation(
                "failure_threshold",
                "must be greater than 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::validation(
                "success_threshold",
                "must be greater than 0",
            ));
        }
        non_zero_duration("open_timeout", self.open_timeout)?;
        if self.half_open_max_calls == Some(0) {
            return Err(ConfigError::validation(
                "half_open_max_calls",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Why the breaker refused a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejection {
    /// State at the time of refusal
    pub state: CircuitState,
    /// Time until a trial call will be admitted, when known
    pub retry_after: Option<Duration>,
}

impl<E> From<CircuitRejection> for ResilienceError<E> {
    fn from(rejection: CircuitRejection) -> Self {
        Self::circuit_open(rejection.state, rejection.retry_after)
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Abandoned,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    next_retry_at: Option<Instant>,
    /// Bumped on every transition; outcomes from an older generation are stale
    generation: u64,
    opened_count: u64,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    /// Mirrors `inner.state` for lock-free reads.
    atomic_state: AtomicU8,
    counters: PatternCounters,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker, validating the configuration
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_valid(CircuitBreakerConfig::default())
    }

    pub(crate) fn from_valid(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                next_retry_at: None,
                generation: 0,
                opened_count: 0,
            }),
            atomic_state: AtomicU8::new(CircuitState::Closed.to_atomic()),
            counters: PatternCounters::new(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation through the breaker
    #[tracing::instrument(skip_all, fields(pattern = "circuit_breaker"))]
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;

        match &result {
            Ok(_) => permit.success(),
            // A caller-initiated cancellation says nothing about the dependency.
            Err(ResilienceError::Cancelled { .. }) => drop(permit),
            Err(_) => permit.failure(),
        }

        result
    }

    /// Ask for permission to run one call.
    ///
    /// Performs the lazy `Open → HalfOpen` transition once the open timeout
    /// has elapsed. The returned permit must be settled with
    /// [`CallPermit::success`] or [`CallPermit::failure`].
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitRejection> {
        self.counters.record_call();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let admitted = match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let retry_at = inner.next_retry_at.unwrap_or(now);
                if now >= retry_at {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    Ok(true)
                } else {
                    Err(CircuitRejection {
                        state: CircuitState::Open,
                        retry_after: Some(retry_at - now),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.max_trial_calls() {
                    inner.half_open_in_flight += 1;
                    debug!(
                        in_flight = inner.half_open_in_flight,
                        limit = self.config.max_trial_calls(),
                        "Half-open trial call admitted"
                    );
                    Ok(true)
                } else {
                    Err(CircuitRejection {
                        state: CircuitState::HalfOpen,
                        retry_after: None,
                    })
                }
            }
        };

        match admitted {
            Ok(trial) => Ok(CallPermit {
                breaker: self,
                generation: inner.generation,
                trial,
                settled: false,
            }),
            Err(rejection) => {
                self.counters.record_rejection();
                debug!(state = %rejection.state, retry_after = ?rejection.retry_after, "Circuit breaker rejected call");
                Err(rejection)
            }
        }
    }

    /// Suspend until an open breaker would admit a trial call.
    ///
    /// Returns immediately unless the breaker is open. The wait is bounded by
    /// the context's deadline and cancellation token.
    pub async fn ready<E>(&self, ctx: &CallContext) -> Result<(), ResilienceError<E>> {
        let retry_at = {
            let inner = self.inner.lock();
            match inner.state {
                CircuitState::Open => inner.next_retry_at,
                _ => None,
            }
        };

        if let Some(retry_at) = retry_at {
            ctx.guard(TimeoutStage::CircuitWait, sleep_until(retry_at))
                .await?;
        }
        Ok(())
    }

    /// Record a success against the current state
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, Outcome::Success, false);
    }

    /// Record a failure against the current state
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.apply(&mut inner, Outcome::Failure, false);
    }

    /// Current state (lock-free)
    ///
    /// An open breaker reports `Open` until a call arrives after the open
    /// timeout; reading the state never causes a transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_atomic(self.atomic_state.load(Ordering::Acquire))
    }

    /// Check if the circuit is closed (lock-free)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Check if the circuit is open (lock-free)
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if the circuit is half-open (lock-free)
    #[must_use]
    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Outcome counters
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Get circuit breaker statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: inner.half_open_in_flight,
            retry_after: match inner.state {
                CircuitState::Open => inner
                    .next_retry_at
                    .map(|at| at.saturating_duration_since(now)),
                _ => None,
            },
            opened_count: inner.opened_count,
            counters: self.counters.snapshot(),
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(from = %inner.state, "Manually resetting circuit breaker");
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
    }

    fn settle(&self, generation: u64, trial: bool, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.counters.record_success(),
            Outcome::Failure => self.counters.record_failure(),
            Outcome::Abandoned => {}
        }

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(?outcome, "Ignoring outcome from a previous circuit generation");
            return;
        }
        self.apply(&mut inner, outcome, trial);
    }

    fn apply(&self, inner: &mut Inner, outcome: Outcome, trial: bool) {
        let now = Instant::now();
        if trial && inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match (inner.state, outcome) {
            (_, Outcome::Abandoned) => {}
            (CircuitState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opening"
                    );
                    self.transition(inner, CircuitState::Open, now);
                } else {
                    debug!(
                        consecutive_failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker failure recorded"
                    );
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    info!(
                        successes = inner.consecutive_successes,
                        "Circuit breaker closing after successful trials"
                    );
                    self.transition(inner, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                warn!("Circuit breaker trial failed, reopening");
                self.transition(inner, CircuitState::Open, now);
            }
            (CircuitState::Open, _) => {
                debug!(?outcome, "Outcome ignored while circuit is open");
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;

        match to {
            CircuitState::Open => {
                inner.next_retry_at = Some(now + self.config.open_timeout);
                inner.opened_count += 1;
            }
            CircuitState::HalfOpen => {}
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.next_retry_at = None;
            }
        }

        self.atomic_state.store(to.to_atomic(), Ordering::Release);
        info!(%from, %to, "Circuit breaker state transition");
    }
}

/// Permission to run one call through a [`CircuitBreaker`]
#[must_use = "a permit must be settled with success() or failure()"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this is a half-open trial call
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report that the call succeeded
    pub fn success(mut self) {
        self.settled = true;
        self.breaker
            .settle(self.generation, self.trial, Outcome::Success);
    }

    /// Report that the call failed
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker
            .settle(self.generation, self.trial, Outcome::Failure);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker
                .settle(self.generation, self.trial, Outcome::Abandoned);
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current circuit breaker state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub consecutive_failures: u32,
    /// Trial successes while half-open
    pub consecutive_successes: u32,
    /// Trial calls currently running
    pub half_open_in_flight: u32,
    /// Time until an open breaker admits a trial
    pub retry_after: Option<Duration>,
    /// How many times the breaker has opened
    pub opened_count: u64,
    /// Outcome counters
    pub counters: CounterSnapshot,
}
