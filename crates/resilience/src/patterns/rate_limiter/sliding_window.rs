//! Sliding window log rate limiter implementation

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::store::KeyedStore;
use super::{RateLimitRejection, RateLimiter, decide};
use crate::core::{
    CounterSnapshot, PatternCounters,
    config::{ConfigError, ConfigResult, ResilienceConfig, non_zero_duration},
};

/// Sliding window parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlidingWindowConfig {
    /// Requests admitted in any window
    pub limit: u64,
    /// Window length
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub window: Duration,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl ResilienceConfig for SlidingWindowConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.limit == 0 {
            return Err(ConfigError::validation("limit", "must be greater than 0"));
        }
        non_zero_duration("window", self.window)
    }
}

/// Sliding window log.
///
/// Keeps the timestamp of every admitted request younger than `window`, so
/// no interval of length `window` ever holds more than `limit` admissions.
#[derive(Debug)]
pub struct SlidingWindow {
    config: SlidingWindowConfig,
    store: KeyedStore<VecDeque<Instant>>,
    counters: PatternCounters,
}

impl SlidingWindow {
    /// Create a sliding window limiter
    pub fn new(config: SlidingWindowConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: KeyedStore::default(),
            counters: PatternCounters::new(),
        })
    }

    fn live(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) < self.config.window
    }
}

impl RateLimiter for SlidingWindow {
    fn check(&self, key: &str) -> Result<(), RateLimitRejection> {
        let now = Instant::now();
        let limit = usize::try_from(self.config.limit).unwrap_or(usize::MAX);

        let decision = self.store.update(key, now, VecDeque::new, |log| {
            while log.front().is_some_and(|&at| !self.live(at, now)) {
                log.pop_front();
            }
            if log.len() < limit {
                log.push_back(now);
                Ok(())
            } else {
                Err(log
                    .front()
                    .map(|&oldest| (oldest + self.config.window) - now))
            }
        });
        decide(&self.counters, key, decision)
    }

    fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        self.store
            .peek(key, |log| {
                let live = log.iter().filter(|&&at| self.live(at, now)).count() as u64;
                self.config.limit.saturating_sub(live)
            })
            .unwrap_or(self.config.limit)
    }

    fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        self.store.evict_idle(idle, Instant::now(), |log, now| {
            !log.iter().any(|&at| self.live(at, now))
        })
    }

    fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}
