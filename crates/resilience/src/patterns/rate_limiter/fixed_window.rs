//! Fixed window rate limiter implementation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::store::KeyedStore;
use super::{RateLimitRejection, RateLimiter, decide};
use crate::core::{
    CounterSnapshot, PatternCounters,
    config::{ConfigError, ConfigResult, ResilienceConfig, non_zero_duration},
};

/// Fixed window parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixedWindowConfig {
    /// Requests admitted per window
    pub limit: u64,
    /// Window length
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub window: Duration,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(1),
        }
    }
}

impl ResilienceConfig for FixedWindowConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.limit == 0 {
            return Err(ConfigError::validation("limit", "must be greater than 0"));
        }
        non_zero_duration("window", self.window)
    }
}

#[derive(Debug)]
struct Counter {
    window_start: Instant,
    count: u64,
}

/// Fixed window counter.
///
/// A key's first request opens a window of `window` length. Up to `limit`
/// requests pass until the window ends; a burst of 2x `limit` is possible
/// across a boundary.
#[derive(Debug)]
pub struct FixedWindow {
    config: FixedWindowConfig,
    store: KeyedStore<Counter>,
    counters: PatternCounters,
}

impl FixedWindow {
    /// Create a fixed window limiter
    pub fn new(config: FixedWindowConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: KeyedStore::default(),
            counters: PatternCounters::new(),
        })
    }
}

impl RateLimiter for FixedWindow {
    fn check(&self, key: &str) -> Result<(), RateLimitRejection> {
        let now = Instant::now();
        let FixedWindowConfig { limit, window } = self.config;

        let decision = self.store.update(
            key,
            now,
            || Counter {
                window_start: now,
                count: 0,
            },
            |counter| {
                if now >= counter.window_start + window {
                    counter.window_start = now;
                    counter.count = 0;
                }
                if counter.count < limit {
                    counter.count += 1;
                    Ok(())
                } else {
                    Err(Some((counter.window_start + window) - now))
                }
            },
        );
        decide(&self.counters, key, decision)
    }

    fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        self.store
            .peek(key, |counter| {
                if now >= counter.window_start + self.config.window {
                    self.config.limit
                } else {
                    self.config.limit.saturating_sub(counter.count)
                }
            })
            .unwrap_or(self.config.limit)
    }

    fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let window = self.config.window;
        self.store.evict_idle(idle, Instant::now(), |counter, now| {
            counter.count == 0 || now >= counter.window_start + window
        })
    }

    fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}
