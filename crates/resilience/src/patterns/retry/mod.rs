//! Retry with exponential backoff, jitter and a shared retry budget
//!
//! The delay before retry `n` (1-based) is
//! `min(max_delay, initial_delay * backoff_factor^(n-1))`. With jitter on,
//! that delay is scaled by a uniform factor in `[0.5, 1.0]`. An error that
//! carries a [`Retryable::retry_after`] hint can only lengthen the delay,
//! never past `max_delay`.

mod budget;

pub use budget::{RetryBudget, RetryBudgetConfig, RetryBudgetStats};

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::{
    CallContext, CounterSnapshot, ExhaustionReason, PatternCounters, ResilienceError,
    TimeoutStage,
    config::{ConfigError, ConfigResult, ResilienceConfig, non_zero_duration},
};
use crate::retryable::Retryable;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_factor: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
    /// Limit on a single attempt; an attempt that runs over counts as a
    /// retryable failure
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Set the attempt limit
    #[must_use = "builder methods must be chained or built"]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff curve
    #[must_use = "builder methods must be chained or built"]
    pub fn with_backoff(mut self, initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.backoff_factor = factor;
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter
    #[must_use = "builder methods must be chained or built"]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the per-attempt timeout
    #[must_use = "builder methods must be chained or built"]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Backoff delay before retry `retry` (1-based), without jitter
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter {
            delay.mul_f64(0.5 + fastrand::f64() * 0.5)
        } else {
            delay
        }
    }
}

impl ResilienceConfig for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::validation("max_attempts", "must be at least 1"));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::validation(
                "max_delay",
                "must not be shorter than initial_delay",
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::validation(
                "backoff_factor",
                format!("must be finite and at least 1.0, got {}", self.backoff_factor),
            ));
        }
        if let Some(timeout) = self.attempt_timeout {
            non_zero_duration("attempt_timeout", timeout)?;
        }
        Ok(())
    }
}

/// Retry policy
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    budget: Option<Arc<RetryBudget>>,
    counters: PatternCounters,
    retries: AtomicU64,
}

impl RetryPolicy {
    /// Create a policy without a budget
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            budget: None,
            counters: PatternCounters::new(),
            retries: AtomicU64::new(0),
        })
    }

    /// Share `budget` with other policies
    #[must_use]
    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Budget in use, if any
    #[must_use]
    pub fn budget(&self) -> Option<&Arc<RetryBudget>> {
        self.budget.as_ref()
    }

    /// Run `operation` until it succeeds or retrying stops
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.execute_with(&CallContext::new(), operation).await
    }

    /// Run `operation` with retries, bounding backoff waits by `ctx`.
    ///
    /// Returns `Operation(e)` at once for a non-retryable error and
    /// `RetryExhausted` once attempts or budget run out.
    #[tracing::instrument(skip_all, fields(pattern = "retry", max_attempts = self.config.max_attempts))]
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.counters.record_call();
        if let Some(budget) = &self.budget {
            budget.deposit();
        }

        let result = self.run(ctx, &mut operation).await;
        match &result {
            Ok(_) => self.counters.record_success(),
            Err(_) => self.counters.record_failure(),
        }
        result
    }

    async fn run<T, E, F, Fut>(&self, ctx: &CallContext, operation: &mut F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt: u32 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(ResilienceError::cancelled("call cancelled before attempt"));
            }
            attempt += 1;

            let error = match self.attempt(operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let (retryable, hint) = match &error {
                ResilienceError::Operation(err) => (err.is_retryable(), err.retry_after()),
                ResilienceError::Timeout {
                    stage: TimeoutStage::Attempt,
                    ..
                } => (true, None),
                _ => (false, None),
            };

            if !retryable {
                debug!(attempt, "Error is not retryable");
                return Err(error);
            }

            if attempt >= self.config.max_attempts {
                warn!(attempts = attempt, "Retry failed: no more attempts");
                return Err(exhausted(attempt, ExhaustionReason::Attempts, error));
            }

            if let Some(budget) = &self.budget
                && !budget.try_withdraw()
            {
                warn!(attempts = attempt, "Retry failed: budget exhausted");
                return Err(exhausted(attempt, ExhaustionReason::Budget, error));
            }

            let delay = self.delay_before(attempt, hint);
            self.retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                attempt,
                delay_ms = delay.as_millis(),
                "Retrying after delay"
            );
            ctx.guard(TimeoutStage::Backoff, sleep(delay)).await?;
        }
    }

    async fn attempt<T, E, F, Fut>(&self, operation: &mut F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(ResilienceError::Operation),
                Err(_elapsed) => Err(ResilienceError::timeout(TimeoutStage::Attempt, limit)),
            },
            None => operation().await.map_err(ResilienceError::Operation),
        }
    }

    /// Delay before retry `retry`, including jitter and the error's hint
    fn delay_before(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = self.config.jittered(self.config.delay_for(retry));
        match hint {
            Some(hint) => delay.max(hint).min(self.config.max_delay),
            None => delay,
        }
    }

    /// Outcome counters; one call per `execute`, however many attempts
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Retries performed across all calls
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

fn exhausted<E>(attempts: u32, reason: ExhaustionReason, last: ResilienceError<E>) -> ResilienceError<E> {
    ResilienceError::RetryExhausted {
        attempts,
        reason,
        last_error: Box::new(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retryable::ErrorClass;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicU32;
    use thiserror::Error;
    use tokio::time::Instant;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("bad request")]
        BadRequest,
        #[error("slow down")]
        SlowDown(Duration),
    }

    impl Retryable for TestError {
        fn class(&self) -> ErrorClass {
            match self {
                Self::BadRequest => ErrorClass::Client,
                _ => ErrorClass::Transient,
            }
        }

        fn retry_after(&self) -> Option<Duration> {
            match self {
                Self::SlowDown(after) => Some(*after),
                _ => None,
            }
        }
    }

    fn config(max_attempts: u32, initial_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff(
                Duration::from_millis(initial_ms),
                2.0,
                Duration::from_millis(max_ms),
            )
            .with_jitter(false)
    }

    #[rstest]
    #[case(1, 1000)]
    #[case(2, 2000)]
    #[case(3, 4000)]
    #[case(4, 8000)]
    #[case(5, 8000)]
    fn test_backoff_sequence(#[case] retry: u32, #[case] expected_ms: u64) {
        let config = config(6, 1000, 8000);
        assert_eq!(config.delay_for(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_huge_exponent_is_capped() {
        let config = config(6, 1000, 8000);
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(config(5, 100, 10_000)).unwrap();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = policy
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(policy.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_surfaces_immediately() {
        let policy = RetryPolicy::new(config(5, 100, 1000)).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::BadRequest)
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Operation(TestError::BadRequest))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let policy = RetryPolicy::new(config(3, 10, 1000)).unwrap();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Flaky)
            })
            .await;

        match result {
            Err(ResilienceError::RetryExhausted {
                attempts,
                reason,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, ExhaustionReason::Attempts);
                assert!(matches!(*last_error, ResilienceError::Operation(TestError::Flaky)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(policy.counters().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_never_retries() {
        let policy = RetryPolicy::new(config(1, 10, 1000)).unwrap();
        let result: Result<(), _> = policy.execute(|| async { Err(TestError::Flaky) }).await;
        assert!(matches!(
            result,
            Err(ResilienceError::RetryExhausted { attempts: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_raises_delay() {
        let policy = RetryPolicy::new(config(2, 100, 5000)).unwrap();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let _ = policy
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::SlowDown(Duration::from_secs(2)))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_capped() {
        let policy = RetryPolicy::new(config(2, 100, 1000)).unwrap();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let _ = policy
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::SlowDown(Duration::from_secs(60)))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion() {
        let budget = Arc::new(
            RetryBudget::new(RetryBudgetConfig {
                max_retry_ratio: 0.0,
                window: Duration::from_secs(10),
                min_retries_per_window: 1,
            })
            .unwrap(),
        );
        let policy = RetryPolicy::new(config(5, 10, 100))
            .unwrap()
            .with_budget(Arc::clone(&budget));

        let result: Result<(), _> = policy.execute(|| async { Err(TestError::Flaky) }).await;
        match result {
            Err(ResilienceError::RetryExhausted {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, ExhaustionReason::Budget);
            }
            other => panic!("expected budget exhaustion, got {other:?}"),
        }
        assert_eq!(budget.stats().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let policy = RetryPolicy::new(
            config(2, 10, 100).with_attempt_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let result: Result<(), ResilienceError<TestError>> = policy
            .execute(|| async {
                sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        match result {
            Err(ResilienceError::RetryExhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(
                    *last_error,
                    ResilienceError::Timeout {
                        stage: TimeoutStage::Attempt,
                        ..
                    }
                ));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_backoff() {
        let policy = RetryPolicy::new(config(5, 1000, 8000)).unwrap();
        let ctx = CallContext::new().with_timeout(Duration::from_millis(500));

        let result: Result<(), _> = policy
            .execute_with(&ctx, || async { Err(TestError::Flaky) })
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::Timeout {
                stage: TimeoutStage::Backoff,
                ..
            })
        ));
    }

    #[rstest]
    #[case::zero_attempts(RetryConfig::default().with_max_attempts(0))]
    #[case::max_below_initial(config(3, 1000, 10))]
    #[case::shrinking_factor(RetryConfig::default().with_backoff(Duration::from_millis(10), 0.5, Duration::from_secs(1)))]
    #[case::nan_factor(RetryConfig::default().with_backoff(Duration::from_millis(10), f64::NAN, Duration::from_secs(1)))]
    fn test_invalid_config(#[case] config: RetryConfig) {
        assert!(RetryPolicy::new(config).is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic_and_capped(
            initial_ms in 1u64..1000,
            factor in 1.1f64..4.0,
            extra_ms in 0u64..60_000,
            retry in 1u32..40,
        ) {
            let config = RetryConfig::default().with_backoff(
                Duration::from_millis(initial_ms),
                factor,
                Duration::from_millis(initial_ms + extra_ms),
            );
            let current = config.delay_for(retry);
            let next = config.delay_for(retry + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= config.max_delay);
            prop_assert!(config.delay_for(1) == config.initial_delay);
        }

        #[test]
        fn prop_jitter_stays_within_half_to_full(delay_ms in 0u64..100_000) {
            let config = RetryConfig::default().with_jitter(true);
            let delay = Duration::from_millis(delay_ms);
            let jittered = config.jittered(delay);
            prop_assert!(jittered <= delay);
            prop_assert!(jittered >= delay / 2);
        }
    }
}
