//! Integration tests for the composed executor
//!
//! - Guard ordering and short-circuiting
//! - Circuit opening, half-open recovery and reset
//! - Deadlines and cancellation across guards
//! - Health snapshots

use bulwark_resilience::prelude::*;
use bulwark_resilience::{ExhaustionReason, FixedWindowConfig, TimeoutStage};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{advance, sleep};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("connection reset")]
    Reset,
    #[error("bad request")]
    BadRequest,
}

impl Retryable for UpstreamError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Reset => ErrorClass::Transient,
            Self::BadRequest => ErrorClass::Client,
        }
    }
}

fn failing_executor(threshold: u32) -> ResilientExecutor {
    ResilientExecutor::builder()
        .circuit_breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_success_threshold(2)
                .with_open_timeout(Duration::from_secs(30)),
        )
        .retry(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_backoff(Duration::from_millis(10), 2.0, Duration::from_millis(100))
                .with_jitter(false),
        )
        .build()
        .unwrap()
}

/// Test: an always-failing dependency exhausts retries, then trips the breaker
#[tokio::test(start_paused = true)]
async fn test_always_failing_opens_circuit() {
    let executor = failing_executor(3);
    let invocations = AtomicU32::new(0);

    for _ in 0..3 {
        let result = executor
            .execute("db", || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::Reset)
            })
            .await;
        match result {
            Err(ResilienceError::RetryExhausted {
                attempts, reason, ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, ExhaustionReason::Attempts);
            }
            other => panic!("expected retry exhaustion, got {other:?}"),
        }
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 6);
    assert_eq!(executor.health("db").circuit_state, CircuitState::Open);

    let result = executor
        .execute("db", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(UpstreamError::Reset)
        })
        .await;
    match result {
        Err(ResilienceError::CircuitOpen { state, retry_after }) => {
            assert_eq!(state, CircuitState::Open);
            assert_eq!(retry_after, Some(Duration::from_secs(30)));
        }
        other => panic!("expected open circuit, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 6);

    let health = executor.health("db");
    assert_eq!(health.rejections.circuit_open, 1);
    assert_eq!(health.circuit_breaker.failures, 3);
    assert!(!health.is_healthy());
}

/// Test: after the open timeout, successful trial calls close the breaker
#[tokio::test(start_paused = true)]
async fn test_half_open_recovery() {
    let executor = failing_executor(1);
    let _ = executor
        .execute("db", || async { Err::<(), _>(UpstreamError::Reset) })
        .await;
    assert_eq!(executor.health("db").circuit_state, CircuitState::Open);

    advance(Duration::from_secs(30)).await;

    executor
        .execute("db", || async { Ok::<_, UpstreamError>(()) })
        .await
        .unwrap();
    assert_eq!(executor.health("db").circuit_state, CircuitState::HalfOpen);

    executor
        .execute("db", || async { Ok::<_, UpstreamError>(()) })
        .await
        .unwrap();
    assert_eq!(executor.health("db").circuit_state, CircuitState::Closed);
}

/// Test: a failed trial call sends the breaker straight back to open
#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let executor = failing_executor(1);
    let _ = executor
        .execute("db", || async { Err::<(), _>(UpstreamError::Reset) })
        .await;

    advance(Duration::from_secs(30)).await;
    let result = executor
        .execute("db", || async { Err::<(), _>(UpstreamError::Reset) })
        .await;
    assert!(matches!(result, Err(ResilienceError::RetryExhausted { .. })));
    assert_eq!(executor.health("db").circuit_state, CircuitState::Open);

    assert!(executor.reset_circuit("db"));
    assert_eq!(executor.health("db").circuit_state, CircuitState::Closed);
}

/// Test: client errors are returned as-is without retrying
#[tokio::test(start_paused = true)]
async fn test_client_error_not_retried() {
    let executor = failing_executor(5);
    let invocations = AtomicU32::new(0);

    let result = executor
        .execute("api", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(UpstreamError::BadRequest)
        })
        .await;

    assert!(matches!(
        result,
        Err(ResilienceError::Operation(UpstreamError::BadRequest))
    ));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(executor.health("api").retry_budget.retries, 0);
}

/// Test: one key's open breaker does not affect another key
#[tokio::test(start_paused = true)]
async fn test_keys_are_isolated() {
    let executor = failing_executor(1);
    let _ = executor
        .execute("bad", || async { Err::<(), _>(UpstreamError::Reset) })
        .await;

    let value = executor
        .execute("good", || async { Ok::<_, UpstreamError>("ok") })
        .await
        .unwrap();

    assert_eq!(value, "ok");
    assert_eq!(executor.health("bad").circuit_state, CircuitState::Open);
    assert_eq!(executor.health("good").circuit_state, CircuitState::Closed);

    let mut keys = executor.keys();
    keys.sort();
    assert_eq!(keys, vec!["bad".to_owned(), "good".to_owned()]);
}

/// Test: a rate-limited call never reaches the breaker or the operation
#[tokio::test(start_paused = true)]
async fn test_rate_limited_call_skips_breaker() {
    let executor = ResilientExecutor::builder()
        .rate_limiter(RateLimiterConfig::FixedWindow(FixedWindowConfig {
            limit: 2,
            window: Duration::from_secs(10),
        }))
        .build()
        .unwrap();

    for _ in 0..2 {
        executor
            .execute("search", || async { Ok::<_, UpstreamError>(()) })
            .await
            .unwrap();
    }
    let result = executor
        .execute("search", || async { Ok::<_, UpstreamError>(()) })
        .await;

    match result {
        Err(ResilienceError::RateLimited { key, retry_after }) => {
            assert_eq!(key, "search");
            assert_eq!(retry_after, Some(Duration::from_secs(10)));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }

    let health = executor.health("search");
    assert_eq!(health.circuit_breaker.total, 2);
    assert_eq!(health.rejections.rate_limited, 1);
    assert_eq!(health.rejections.total(), 1);
}

/// Test: the call deadline bounds the bulkhead queue wait
#[tokio::test(start_paused = true)]
async fn test_deadline_while_queued() {
    let executor = ResilientExecutor::builder()
        .bulkhead(BulkheadConfig::new(1, 1))
        .build()
        .unwrap();

    let slow = executor.execute("report", || async {
        sleep(Duration::from_secs(1)).await;
        Ok::<_, UpstreamError>(())
    });
    let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
    let impatient = executor.execute_with("report", &ctx, || async { Ok::<_, UpstreamError>(()) });

    let (slow, impatient) = tokio::join!(slow, impatient);

    assert!(slow.is_ok());
    match impatient {
        Err(ResilienceError::Timeout { stage, elapsed }) => {
            assert_eq!(stage, TimeoutStage::Queue);
            assert_eq!(elapsed, Duration::from_millis(50));
        }
        other => panic!("expected queue timeout, got {other:?}"),
    }
    assert_eq!(executor.health("report").queued, 0);
}

/// Test: cancelling during backoff stops the call without a breaker failure
#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let executor = ResilientExecutor::builder()
        .retry(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_backoff(Duration::from_secs(1), 2.0, Duration::from_secs(10))
                .with_jitter(false),
        )
        .build()
        .unwrap();
    let token = CancellationToken::new();
    let ctx = CallContext::new().with_cancellation(token.clone());
    let invocations = AtomicU32::new(0);

    let call = executor.execute_with("queue", &ctx, || async {
        invocations.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(UpstreamError::Reset)
    });
    let cancel = async {
        sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(call, cancel);

    assert!(matches!(result, Err(ResilienceError::Cancelled { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let health = executor.health("queue");
    assert_eq!(health.circuit_breaker.failures, 0);
    assert_eq!(health.circuit_state, CircuitState::Closed);
}

/// Test: taking a health snapshot never consumes quota or creates keys
#[tokio::test(start_paused = true)]
async fn test_health_is_read_only() {
    let executor = ResilientExecutor::builder()
        .rate_limiter(RateLimiterConfig::FixedWindow(FixedWindowConfig {
            limit: 3,
            window: Duration::from_secs(1),
        }))
        .build()
        .unwrap();

    executor
        .execute("svc", || async { Ok::<_, UpstreamError>(()) })
        .await
        .unwrap();

    let first = executor.health("svc");
    for _ in 0..10 {
        assert_eq!(executor.health("svc"), first);
    }
    assert_eq!(first.tokens_remaining, 2);

    let _ = executor.health("ghost");
    assert_eq!(executor.keys(), vec!["svc".to_owned()]);
}

/// Test: closing the executor rejects new calls and wakes queued ones
#[tokio::test(start_paused = true)]
async fn test_close_wakes_queued_callers() {
    let executor = ResilientExecutor::builder()
        .bulkhead(BulkheadConfig::new(1, 4).with_queue_timeout(None))
        .build()
        .unwrap();

    let running = executor.execute("job", || async {
        sleep(Duration::from_secs(1)).await;
        Ok::<_, UpstreamError>("done")
    });
    let queued = executor.execute("job", || async { Ok::<_, UpstreamError>("late") });
    let closer = async {
        sleep(Duration::from_millis(10)).await;
        executor.close();
    };

    let (running, queued, ()) = tokio::join!(running, queued, closer);

    assert_eq!(running.unwrap(), "done");
    assert!(matches!(queued, Err(ResilienceError::Cancelled { .. })));

    let after = executor
        .execute("job", || async { Ok::<_, UpstreamError>("never") })
        .await;
    assert!(matches!(after, Err(ResilienceError::Cancelled { .. })));
}
