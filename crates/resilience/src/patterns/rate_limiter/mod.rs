//! Keyed rate limiting
//!
//! Four algorithms share one [`RateLimiter`] trait and one per-key store.
//! [`AnyRateLimiter`] selects an algorithm from configuration without
//! dynamic dispatch.
//!
//! | Algorithm | Burst at boundaries | Memory per key |
//! |-----------|---------------------|----------------|
//! | [`FixedWindow`] | up to 2x `limit` | O(1) |
//! | [`SlidingWindow`] | none | O(`limit`) |
//! | [`TokenBucket`] | `capacity` | O(1) |
//! | [`LeakyBucket`] | `capacity` | O(1) |

mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod store;
mod token_bucket;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{
    CounterSnapshot, PatternCounters, ResilienceError,
    config::{ConfigResult, ResilienceConfig},
};

pub use fixed_window::{FixedWindow, FixedWindowConfig};
pub use leaky_bucket::{LeakyBucket, LeakyBucketConfig};
pub use sliding_window::{SlidingWindow, SlidingWindowConfig};
pub use token_bucket::{TokenBucket, TokenBucketConfig};

/// A key was over its quota
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for key `{key}`")]
pub struct RateLimitRejection {
    /// Key that was over quota
    pub key: String,
    /// Earliest time the key could be admitted again
    pub retry_after: Option<Duration>,
}

impl<E> From<RateLimitRejection> for ResilienceError<E> {
    fn from(rejection: RateLimitRejection) -> Self {
        Self::RateLimited {
            key: rejection.key,
            retry_after: rejection.retry_after,
        }
    }
}

/// Keyed rate limiter.
///
/// Decisions never suspend. State for a key is created on its first
/// [`check`](Self::check).
pub trait RateLimiter: Send + Sync {
    /// Admit or reject one request for `key`
    fn check(&self, key: &str) -> Result<(), RateLimitRejection>;

    /// Admit or reject one request for `key`, discarding the retry hint
    fn allow(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    /// Requests `key` could make right now. Never creates or mutates state;
    /// unseen keys report full capacity.
    fn remaining(&self, key: &str) -> u64;

    /// Forget the state of `key`
    fn reset(&self, key: &str);

    /// Drop state for keys idle at least `idle`; returns how many were dropped
    fn evict_idle(&self, idle: Duration) -> usize;

    /// Number of keys with live state
    fn tracked_keys(&self) -> usize;

    /// Admission counters across all keys
    fn counters(&self) -> CounterSnapshot;
}

/// Rate limiting algorithm and its parameters.
///
/// Serialized with an `algorithm` tag:
/// `{"algorithm": "slidingWindow", "limit": 100, "window": "60s"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "camelCase")]
pub enum RateLimiterConfig {
    /// Counter reset at fixed window boundaries
    FixedWindow(FixedWindowConfig),
    /// Log of request timestamps over a moving window
    SlidingWindow(SlidingWindowConfig),
    /// Tokens refilled continuously up to a capacity
    TokenBucket(TokenBucketConfig),
    /// Level drained at a constant rate
    LeakyBucket(LeakyBucketConfig),
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::TokenBucket(TokenBucketConfig::default())
    }
}

impl RateLimiterConfig {
    /// Name of the configured algorithm
    #[must_use]
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::FixedWindow(_) => "fixed_window",
            Self::SlidingWindow(_) => "sliding_window",
            Self::TokenBucket(_) => "token_bucket",
            Self::LeakyBucket(_) => "leaky_bucket",
        }
    }
}

impl ResilienceConfig for RateLimiterConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::FixedWindow(config) => config.validate(),
            Self::SlidingWindow(config) => config.validate(),
            Self::TokenBucket(config) => config.validate(),
            Self::LeakyBucket(config) => config.validate(),
        }
    }
}

/// Enum wrapper selecting one algorithm at runtime
#[derive(Debug)]
pub enum AnyRateLimiter {
    /// Fixed window counter
    FixedWindow(FixedWindow),
    /// Sliding window log
    SlidingWindow(SlidingWindow),
    /// Token bucket
    TokenBucket(TokenBucket),
    /// Leaky bucket
    LeakyBucket(LeakyBucket),
}

impl AnyRateLimiter {
    /// Build the limiter described by `config`
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Ok(match config {
            RateLimiterConfig::FixedWindow(config) => Self::FixedWindow(FixedWindow::new(config)?),
            RateLimiterConfig::SlidingWindow(config) => {
                Self::SlidingWindow(SlidingWindow::new(config)?)
            }
            RateLimiterConfig::TokenBucket(config) => Self::TokenBucket(TokenBucket::new(config)?),
            RateLimiterConfig::LeakyBucket(config) => Self::LeakyBucket(LeakyBucket::new(config)?),
        })
    }

    fn inner(&self) -> &dyn RateLimiter {
        match self {
            Self::FixedWindow(limiter) => limiter,
            Self::SlidingWindow(limiter) => limiter,
            Self::TokenBucket(limiter) => limiter,
            Self::LeakyBucket(limiter) => limiter,
        }
    }
}

impl RateLimiter for AnyRateLimiter {
    fn check(&self, key: &str) -> Result<(), RateLimitRejection> {
        self.inner().check(key)
    }

    fn remaining(&self, key: &str) -> u64 {
        self.inner().remaining(key)
    }

    fn reset(&self, key: &str) {
        self.inner().reset(key);
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        self.inner().evict_idle(idle)
    }

    fn tracked_keys(&self) -> usize {
        self.inner().tracked_keys()
    }

    fn counters(&self) -> CounterSnapshot {
        self.inner().counters()
    }
}

/// Record one admission decision and turn a retry hint into a rejection
fn decide(
    counters: &PatternCounters,
    key: &str,
    decision: Result<(), Option<Duration>>,
) -> Result<(), RateLimitRejection> {
    counters.record_call();
    match decision {
        Ok(()) => {
            counters.record_success();
            Ok(())
        }
        Err(retry_after) => {
            counters.record_rejection();
            tracing::debug!(key, ?retry_after, "Rate limit exceeded");
            Err(RateLimitRejection {
                key: key.to_owned(),
                retry_after,
            })
        }
    }
}
