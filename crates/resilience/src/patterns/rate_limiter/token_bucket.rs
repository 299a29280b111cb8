//! Token bucket rate limiter implementation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::store::KeyedStore;
use super::{RateLimitRejection, RateLimiter, decide};
use crate::core::{
    CounterSnapshot, PatternCounters,
    config::{ConfigError, ConfigResult, ResilienceConfig, positive_rate},
};

/// Token bucket parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenBucketConfig {
    /// Maximum tokens held, and so the largest burst
    pub capacity: u64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            refill_rate: 50.0,
        }
    }
}

impl ResilienceConfig for TokenBucketConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::validation("capacity", "must be greater than 0"));
        }
        positive_rate("refill_rate", self.refill_rate)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refilled(&self, now: Instant, capacity: f64, rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * rate).min(capacity)
    }
}

/// Token bucket rate limiter
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    store: KeyedStore<Bucket>,
    counters: PatternCounters,
}

impl TokenBucket {
    /// Create a token bucket limiter; new keys start full
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: KeyedStore::default(),
            counters: PatternCounters::new(),
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn capacity(&self) -> f64 {
        self.config.capacity as f64
    }
}

impl RateLimiter for TokenBucket {
    fn check(&self, key: &str) -> Result<(), RateLimitRejection> {
        let now = Instant::now();
        let capacity = self.capacity();
        let rate = self.config.refill_rate;

        let decision = self.store.update(
            key,
            now,
            || Bucket {
                tokens: capacity,
                last_refill: now,
            },
            |bucket| {
                bucket.tokens = bucket.refilled(now, capacity, rate);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    Ok(())
                } else {
                    Err(Duration::try_from_secs_f64((1.0 - bucket.tokens) / rate).ok())
                }
            },
        );
        decide(&self.counters, key, decision)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        let capacity = self.capacity();
        self.store
            .peek(key, |bucket| {
                bucket.refilled(now, capacity, self.config.refill_rate).floor() as u64
            })
            .unwrap_or(self.config.capacity)
    }

    fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let capacity = self.capacity();
        let rate = self.config.refill_rate;
        self.store.evict_idle(idle, Instant::now(), |bucket, now| {
            bucket.refilled(now, capacity, rate) >= capacity
        })
    }

    fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}
