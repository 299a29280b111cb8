//! Resilience patterns implementations

pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitRejection,
    CircuitState,
};
pub use rate_limiter::{
    AnyRateLimiter, FixedWindow, FixedWindowConfig, LeakyBucket, LeakyBucketConfig,
    RateLimitRejection, RateLimiter, RateLimiterConfig, SlidingWindow, SlidingWindowConfig,
    TokenBucket, TokenBucketConfig,
};
pub use retry::{RetryBudget, RetryBudgetConfig, RetryBudgetStats, RetryConfig, RetryPolicy};
