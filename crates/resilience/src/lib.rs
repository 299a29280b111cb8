//! # Bulwark Resilience
//!
//! Guards for calls to unreliable dependencies, usable alone or composed
//! through a keyed executor.
//!
//! ## Features
//!
//! - **Circuit Breaker**: stop calling a dependency that keeps failing
//! - **Bulkhead**: cap concurrent calls with a bounded FIFO wait queue
//! - **Rate Limiting**: fixed window, sliding window, token bucket and leaky
//!   bucket, all keyed
//! - **Retry**: exponential backoff with jitter, bounded by a shared budget
//! - **Executor**: all of the above per key, with health snapshots
//!
//! ## Quick Start
//!
//! ```rust
//! use bulwark_resilience::prelude::*;
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("upstream unavailable")]
//! struct Unavailable;
//!
//! impl Retryable for Unavailable {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = ResilientExecutor::builder()
//!         .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(3))
//!         .bulkhead(BulkheadConfig::new(8, 32))
//!         .retry(RetryConfig::default().with_max_attempts(2))
//!         .build()?;
//!
//!     let value = executor
//!         .execute("billing", || async { Ok::<_, Unavailable>("charged") })
//!         .await?;
//!     assert_eq!(value, "charged");
//!
//!     let health = executor.health("billing");
//!     assert!(health.is_healthy());
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

// Shared types: errors, config, counters, call context
pub mod core;

// Individual guards
pub mod patterns;

pub mod executor;
pub mod health;
pub mod observability;
pub mod retryable;

pub use crate::core::{
    CallContext, ConfigError, ConfigResult, CounterSnapshot, ErrorKind, ExecutorConfig,
    ExhaustionReason, PatternCounters, ResilienceConfig, ResilienceError, ResilienceResult,
    TimeoutStage,
};
pub use executor::{ExecutorBuilder, ResilientExecutor};
pub use health::{HealthSnapshot, RejectionCounts};
pub use observability::{LogConfig, LogError, LogFormat, init_logging};
pub use retryable::{ErrorClass, Retryable};

pub use patterns::{
    // Circuit breaker
    CallPermit,
    CircuitBreaker,
    CircuitBreakerConfig,
    CircuitBreakerStats,
    CircuitRejection,
    CircuitState,

    // Bulkhead
    Bulkhead,
    BulkheadConfig,
    BulkheadPermit,
    BulkheadStats,

    // Rate limiting
    AnyRateLimiter,
    FixedWindow,
    FixedWindowConfig,
    LeakyBucket,
    LeakyBucketConfig,
    RateLimitRejection,
    RateLimiter,
    RateLimiterConfig,
    SlidingWindow,
    SlidingWindowConfig,
    TokenBucket,
    TokenBucketConfig,

    // Retry
    RetryBudget,
    RetryBudgetConfig,
    RetryBudgetStats,
    RetryConfig,
    RetryPolicy,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::core::{CallContext, ResilienceConfig, ResilienceError, ResilienceResult};
    pub use crate::patterns::{
        AnyRateLimiter, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig,
        CircuitState, RateLimiter, RateLimiterConfig, RetryConfig, RetryPolicy,
    };
    pub use crate::retryable::{ErrorClass, Retryable};
    pub use crate::{ExecutorBuilder, HealthSnapshot, ResilientExecutor};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
