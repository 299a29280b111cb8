//! Leaky bucket rate limiter implementation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::store::KeyedStore;
use super::{RateLimitRejection, RateLimiter, decide};
use crate::core::{
    CounterSnapshot, PatternCounters,
    config::{ConfigError, ConfigResult, ResilienceConfig, positive_rate},
};

/// Leaky bucket parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeakyBucketConfig {
    /// Maximum level before requests are rejected
    pub capacity: u64,
    /// Units drained per second
    pub leak_rate: f64,
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            leak_rate: 50.0,
        }
    }
}

impl ResilienceConfig for LeakyBucketConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::validation("capacity", "must be greater than 0"));
        }
        positive_rate("leak_rate", self.leak_rate)
    }
}

#[derive(Debug, Clone, Copy)]
struct Level {
    level: u64,
    last_leak: Instant,
}

impl Level {
    /// Drain whole units. `last_leak` only advances by the time those units
    /// took, so partial progress toward the next unit is kept.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn leaked(self, now: Instant, rate: f64) -> Self {
        if self.level == 0 {
            return Self {
                level: 0,
                last_leak: now,
            };
        }

        let elapsed = now.saturating_duration_since(self.last_leak).as_secs_f64();
        let units = (elapsed * rate).floor();
        if units < 1.0 {
            return self;
        }

        let drained = units.min(self.level as f64) as u64;
        let level = self.level - drained;
        let last_leak = if level == 0 {
            now
        } else {
            (self.last_leak + Duration::from_secs_f64(units / rate)).min(now)
        };
        Self { level, last_leak }
    }
}

/// Leaky bucket rate limiter
///
/// Each admitted request raises the key's level by one; the level drains at
/// `leak_rate` per second. Requests are rejected while the level is at
/// `capacity`.
#[derive(Debug)]
pub struct LeakyBucket {
    config: LeakyBucketConfig,
    store: KeyedStore<Level>,
    counters: PatternCounters,
}

impl LeakyBucket {
    /// Create a leaky bucket limiter; new keys start empty
    pub fn new(config: LeakyBucketConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: KeyedStore::default(),
            counters: PatternCounters::new(),
        })
    }
}

impl RateLimiter for LeakyBucket {
    fn check(&self, key: &str) -> Result<(), RateLimitRejection> {
        let now = Instant::now();
        let LeakyBucketConfig {
            capacity,
            leak_rate,
        } = self.config;

        let decision = self.store.update(
            key,
            now,
            || Level {
                level: 0,
                last_leak: now,
            },
            |state| {
                *state = state.leaked(now, leak_rate);
                if state.level < capacity {
                    state.level += 1;
                    Ok(())
                } else {
                    let retry_after = Duration::try_from_secs_f64(1.0 / leak_rate)
                        .ok()
                        .and_then(|unit| state.last_leak.checked_add(unit))
                        .map(|next_unit| next_unit.saturating_duration_since(now));
                    Err(retry_after)
                }
            },
        );
        decide(&self.counters, key, decision)
    }

    fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        self.store
            .peek(key, |state| {
                let level = state.leaked(now, self.config.leak_rate).level;
                self.config.capacity.saturating_sub(level)
            })
            .unwrap_or(self.config.capacity)
    }

    fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let rate = self.config.leak_rate;
        self.store
            .evict_idle(idle, Instant::now(), |state, now| state.leaked(now, rate).level == 0)
    }

    fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}
