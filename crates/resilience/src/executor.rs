//! Composite executor applying every guard in a fixed order
//!
//! ```text
//! Bulkhead admission → RateLimiter check → CircuitBreaker gate → Retry(operation)
//! ```
//!
//! Each key gets its own breaker and bulkhead, created on first use. The
//! rate limiter keeps per-key state internally; the retry budget is shared by
//! every key. An earlier rejection short-circuits the later stages, and the
//! breaker sees one outcome per call regardless of how many attempts the
//! retry loop made.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{
    CallContext, CounterSnapshot, ExecutorConfig, PatternCounters, ResilienceError,
    config::{ConfigResult, ResilienceConfig},
};
use crate::health::{HealthSnapshot, RejectionCounts};
use crate::patterns::{
    AnyRateLimiter, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    RateLimiter, RateLimiterConfig, RetryBudget, RetryBudgetConfig, RetryConfig, RetryPolicy,
};
use crate::retryable::Retryable;

#[derive(Debug)]
struct KeyGuards {
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
    rate_limited: AtomicU64,
}

/// Guards a set of keyed dependencies with bulkhead, rate limiter, circuit
/// breaker and retry
#[derive(Debug)]
pub struct ResilientExecutor {
    config: ExecutorConfig,
    guards: DashMap<String, Arc<KeyGuards>>,
    limiter: AnyRateLimiter,
    retry: RetryPolicy,
    budget: Arc<RetryBudget>,
    counters: PatternCounters,
    closed: AtomicBool,
}

impl ResilientExecutor {
    /// Create an executor, validating every component configuration
    pub fn new(config: ExecutorConfig) -> ConfigResult<Self> {
        config.validate()?;

        let budget = Arc::new(RetryBudget::new(config.retry_budget.clone())?);
        let retry = RetryPolicy::new(config.retry.clone())?.with_budget(Arc::clone(&budget));
        let limiter = AnyRateLimiter::new(config.rate_limiter.clone())?;

        info!(
            algorithm = config.rate_limiter.algorithm(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            max_concurrent = config.bulkhead.max_concurrent,
            max_attempts = config.retry.max_attempts,
            "Resilient executor created"
        );

        Ok(Self {
            config,
            guards: DashMap::new(),
            limiter,
            retry,
            budget,
            counters: PatternCounters::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Start building an executor from defaults
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `operation` for `key` through every guard
    pub async fn execute<T, E, F, Fut>(&self, key: &str, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.execute_with(key, &CallContext::new(), operation).await
    }

    /// Run `operation` for `key`, bounding every wait by `ctx`
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        key: &str,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.counters.record_call();
        if self.closed.load(Ordering::Acquire) {
            self.counters.record_rejection();
            return Err(ResilienceError::cancelled("executor closed"));
        }

        let guards = self.guards_for(key);
        let guards = guards.as_ref();
        let result = guards
            .bulkhead
            .execute_with(ctx, || async move {
                if let Err(rejection) = self.limiter.check(key) {
                    guards.rate_limited.fetch_add(1, Ordering::Relaxed);
                    return Err(rejection.into());
                }
                guards
                    .breaker
                    .execute(|| self.retry.execute_with(ctx, operation))
                    .await
            })
            .await;

        match &result {
            Ok(_) => self.counters.record_success(),
            Err(err) if err.is_rejection() => self.counters.record_rejection(),
            Err(err) => {
                debug!(kind = ?err.kind(), "Guarded call failed");
                self.counters.record_failure();
            }
        }
        result
    }

    /// Current health of `key`. Never creates or mutates state.
    #[must_use]
    pub fn health(&self, key: &str) -> HealthSnapshot {
        let guards = self.guards.get(key).map(|entry| Arc::clone(entry.value()));
        let tokens_remaining = self.limiter.remaining(key);
        let retry_budget = self.budget.stats();

        match guards {
            Some(guards) => {
                let breaker = guards.breaker.counters();
                let bulkhead = guards.bulkhead.counters();
                HealthSnapshot {
                    key: key.to_owned(),
                    circuit_state: guards.breaker.state(),
                    running: guards.bulkhead.running(),
                    queued: guards.bulkhead.queued(),
                    tokens_remaining,
                    rejections: RejectionCounts {
                        rate_limited: guards.rate_limited.load(Ordering::Relaxed),
                        bulkhead: bulkhead.rejections,
                        circuit_open: breaker.rejections,
                    },
                    circuit_breaker: breaker,
                    bulkhead,
                    retry_budget,
                }
            }
            None => HealthSnapshot {
                key: key.to_owned(),
                circuit_state: CircuitState::Closed,
                running: 0,
                queued: 0,
                tokens_remaining,
                rejections: RejectionCounts::default(),
                circuit_breaker: CounterSnapshot::default(),
                bulkhead: CounterSnapshot::default(),
                retry_budget,
            },
        }
    }

    /// Keys that have been executed at least once
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.guards.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Outcome counters across all keys
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Reset the circuit breaker of `key`, if it exists
    pub fn reset_circuit(&self, key: &str) -> bool {
        match self.guards.get(key) {
            Some(guards) => {
                guards.breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Drop rate limiter state for keys idle longer than the configured
    /// `idle_eviction`. Returns how many keys were dropped.
    pub fn evict_idle(&self) -> usize {
        let Some(idle) = self.config.idle_eviction else {
            return 0;
        };
        let evicted = self.limiter.evict_idle(idle);
        if evicted > 0 {
            debug!(evicted, remaining = self.limiter.tracked_keys(), "Evicted idle limiter keys");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `idle_eviction` period
    /// until `token` is cancelled or the executor is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let executor: Weak<Self> = Arc::downgrade(self);
        let period = self.config.idle_eviction;

        tokio::spawn(async move {
            let Some(period) = period else {
                token.cancelled().await;
                return;
            };
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(executor) = executor.upgrade() else { break };
                        executor.evict_idle();
                    }
                }
            }
            debug!("Executor maintenance stopped");
        })
    }

    /// Stop admitting calls. Queued callers fail with `Cancelled`; running
    /// operations finish.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(keys = self.guards.len(), "Closing resilient executor");
        for entry in &self.guards {
            entry.value().bulkhead.close();
        }
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn guards_for(&self, key: &str) -> Arc<KeyGuards> {
        if let Some(existing) = self.guards.get(key).map(|entry| Arc::clone(entry.value())) {
            return existing;
        }
        Arc::clone(
            self.guards
                .entry(key.to_owned())
                .or_insert_with(|| {
                    debug!(key, "Creating guards for key");
                    Arc::new(KeyGuards {
                        breaker: CircuitBreaker::from_valid(self.config.circuit_breaker.clone()),
                        bulkhead: Bulkhead::from_valid(self.config.bulkhead.clone()),
                        rate_limited: AtomicU64::new(0),
                    })
                })
                .value(),
        )
    }
}

/// Builder for [`ResilientExecutor`]
#[derive(Debug, Clone, Default)]
pub struct ExecutorBuilder {
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    /// Start from an existing configuration
    #[must_use]
    pub fn from_config(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Set the circuit breaker configuration
    #[must_use = "builder methods must be chained or built"]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set the bulkhead configuration
    #[must_use = "builder methods must be chained or built"]
    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.config.bulkhead = config;
        self
    }

    /// Set the rate limiter algorithm
    #[must_use = "builder methods must be chained or built"]
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limiter = config;
        self
    }

    /// Set the retry configuration
    #[must_use = "builder methods must be chained or built"]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Set the retry budget configuration
    #[must_use = "builder methods must be chained or built"]
    pub fn retry_budget(mut self, config: RetryBudgetConfig) -> Self {
        self.config.retry_budget = config;
        self
    }

    /// Set or disable idle key eviction
    #[must_use = "builder methods must be chained or built"]
    pub fn idle_eviction(mut self, idle: Option<Duration>) -> Self {
        self.config.idle_eviction = idle;
        self
    }

    /// Build the executor
    pub fn build(self) -> ConfigResult<ResilientExecutor> {
        ResilientExecutor::new(self.config)
    }
}
