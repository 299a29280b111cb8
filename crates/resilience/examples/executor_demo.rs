//! Executor demonstration
//!
//! Drives a flaky dependency through the executor and prints the health
//! snapshot after each phase. Run with `RUST_LOG=debug` to see every guard
//! decision.

use bulwark_resilience::prelude::*;
use bulwark_resilience::{LogConfig, SlidingWindowConfig, init_logging};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum PaymentError {
    #[error("gateway timeout")]
    GatewayTimeout,
    #[error("card declined")]
    Declined,
}

impl Retryable for PaymentError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::GatewayTimeout => ErrorClass::Transient,
            Self::Declined => ErrorClass::Client,
        }
    }
}

fn print_health(executor: &ResilientExecutor, key: &str) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(&executor.health(key))?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LogConfig::from_env())?;

    let executor = ResilientExecutor::builder()
        .circuit_breaker(
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_open_timeout(Duration::from_millis(500)),
        )
        .bulkhead(BulkheadConfig::new(4, 8))
        .rate_limiter(RateLimiterConfig::SlidingWindow(SlidingWindowConfig {
            limit: 20,
            window: Duration::from_secs(1),
        }))
        .retry(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(20), 2.0, Duration::from_millis(200)),
        )
        .build()?;

    println!("=== Flaky gateway: fails twice, then recovers ===");
    let attempts = AtomicU32::new(0);
    let receipt = executor
        .execute("payments", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PaymentError::GatewayTimeout)
            } else {
                Ok("receipt-001")
            }
        })
        .await?;
    println!("charged after {} attempts: {receipt}", attempts.load(Ordering::SeqCst));

    println!("\n=== Client error is not retried ===");
    match executor
        .execute("payments", || async { Err::<(), _>(PaymentError::Declined) })
        .await
    {
        Err(err) => println!("rejected: {err}"),
        Ok(()) => println!("unexpected success"),
    }

    println!("\n=== Gateway down: breaker opens ===");
    for _ in 0..3 {
        let result = executor
            .execute("payments", || async { Err::<(), _>(PaymentError::GatewayTimeout) })
            .await;
        if let Err(err) = result {
            println!("{:?}: {err}", err.kind());
        }
    }
    print_health(&executor, "payments")?;

    println!("\n=== After the open timeout ===");
    tokio::time::sleep(Duration::from_millis(600)).await;
    executor
        .execute("payments", || async { Ok::<_, PaymentError>(()) })
        .await?;
    print_health(&executor, "payments")?;

    Ok(())
}
