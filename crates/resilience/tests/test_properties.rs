//! Property tests for the composed guards

use bulwark_resilience::prelude::*;
use bulwark_resilience::{FixedWindowConfig, RetryBudget, RetryBudgetConfig};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("always down")]
struct Down;

impl Retryable for Down {}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// An always-failing operation never succeeds: every call ends in retry
    /// exhaustion or an open circuit, and the operation runs at most
    /// `max_attempts` times per call.
    #[test]
    fn prop_always_failing_never_succeeds(
        threshold in 1u32..6,
        max_attempts in 1u32..5,
        calls in 1usize..20,
    ) {
        paused_runtime().block_on(async {
            let executor = ResilientExecutor::builder()
                .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(threshold))
                .retry(
                    RetryConfig::default()
                        .with_max_attempts(max_attempts)
                        .with_backoff(Duration::from_millis(1), 2.0, Duration::from_millis(10)),
                )
                .build()
                .unwrap();
            let invocations = AtomicU32::new(0);

            for _ in 0..calls {
                let result = executor
                    .execute("dep", || async {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Down)
                    })
                    .await;
                let gave_up = matches!(
                    result,
                    Err(ResilienceError::RetryExhausted { .. } | ResilienceError::CircuitOpen { .. })
                );
                prop_assert!(gave_up, "unexpected result: {:?}", result);
            }

            let failed_calls = (calls as u32).min(threshold);
            prop_assert!(invocations.load(Ordering::SeqCst) <= failed_calls * max_attempts);
            prop_assert_eq!(
                executor.health("dep").circuit_state == CircuitState::Open,
                calls as u32 >= threshold
            );
            Ok(())
        })?;
    }

    /// A fixed window never admits more than its limit within one window,
    /// and health snapshots never change what is admitted.
    #[test]
    fn prop_window_admits_at_most_limit(limit in 1u64..50, requests in 0usize..120) {
        paused_runtime().block_on(async {
            let executor = ResilientExecutor::builder()
                .rate_limiter(RateLimiterConfig::FixedWindow(FixedWindowConfig {
                    limit,
                    window: Duration::from_secs(60),
                }))
                .build()
                .unwrap();

            let mut admitted = 0u64;
            for _ in 0..requests {
                let _ = executor.health("k");
                if executor.execute("k", || async { Ok::<_, Down>(()) }).await.is_ok() {
                    admitted += 1;
                }
            }

            prop_assert_eq!(admitted, limit.min(requests as u64));
            prop_assert_eq!(
                executor.health("k").tokens_remaining,
                limit - admitted
            );
            Ok(())
        })?;
    }

    /// Retries granted by the budget never exceed the reserve plus the
    /// configured share of requests.
    #[test]
    fn prop_budget_bounds_retries(
        ratio in 0.0f64..=1.0,
        reserve in 0u32..20,
        requests in 0u32..200,
        attempts in 0u32..400,
    ) {
        let budget = RetryBudget::new(RetryBudgetConfig {
            max_retry_ratio: ratio,
            window: Duration::from_secs(3600),
            min_retries_per_window: reserve,
        })
        .unwrap();

        for _ in 0..requests {
            budget.deposit();
        }
        let granted = (0..attempts).filter(|_| budget.try_withdraw()).count() as f64;

        prop_assert!(granted <= f64::from(reserve) + ratio * f64::from(requests) + 1.0);
        prop_assert_eq!(budget.stats().requests, u64::from(requests));
    }
}
