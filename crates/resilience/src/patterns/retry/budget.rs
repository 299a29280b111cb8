//! Retry budget shared across calls
//!
//! Caps retries at a fraction of recent requests so a struggling dependency
//! is not hit by a retry storm. A small per-window reserve lets low-traffic
//! callers retry at all.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::{ConfigError, ConfigResult, ResilienceConfig, non_zero_duration};

const SLOTS_PER_WINDOW: u32 = 10;

/// Retry budget configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryBudgetConfig {
    /// Largest allowed ratio of retries to requests within the window
    pub max_retry_ratio: f64,
    /// Length of the accounting window
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub window: Duration,
    /// Retries always allowed per window regardless of the ratio
    pub min_retries_per_window: u32,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            max_retry_ratio: 0.2,
            window: Duration::from_secs(10),
            min_retries_per_window: 10,
        }
    }
}

impl ResilienceConfig for RetryBudgetConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.max_retry_ratio) {
            return Err(ConfigError::validation(
                "max_retry_ratio",
                format!("must be within [0, 1], got {}", self.max_retry_ratio),
            ));
        }
        non_zero_duration("window", self.window)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    start: Instant,
    requests: u64,
    retries: u64,
}

/// Sliding count of requests and retries over `window`, kept in coarse
/// time slots and pruned lazily on every access.
#[derive(Debug)]
pub struct RetryBudget {
    config: RetryBudgetConfig,
    slot_len: Duration,
    slots: Mutex<VecDeque<Slot>>,
}

impl RetryBudget {
    /// Create a budget, validating the configuration
    pub fn new(config: RetryBudgetConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            slot_len: (config.window / SLOTS_PER_WINDOW).max(Duration::from_nanos(1)),
            config,
            slots: Mutex::new(VecDeque::new()),
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RetryBudgetConfig {
        &self.config
    }

    /// Record one request
    pub fn deposit(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        self.current_slot(&mut slots, now).requests += 1;
    }

    /// Spend one retry if the budget allows it
    #[allow(clippy::cast_precision_loss)]
    pub fn try_withdraw(&self) -> bool {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let (requests, retries) = self.totals(&slots, now);

        let within_reserve = retries < u64::from(self.config.min_retries_per_window);
        let within_ratio = (retries as f64) < self.config.max_retry_ratio * requests as f64;
        if within_reserve || within_ratio {
            self.current_slot(&mut slots, now).retries += 1;
            true
        } else {
            debug!(requests, retries, "Retry budget exhausted");
            false
        }
    }

    /// Requests and retries currently inside the window
    #[must_use]
    pub fn stats(&self) -> RetryBudgetStats {
        let slots = self.slots.lock();
        let (requests, retries) = self.totals(&slots, Instant::now());
        RetryBudgetStats { requests, retries }
    }

    fn totals(&self, slots: &VecDeque<Slot>, now: Instant) -> (u64, u64) {
        slots
            .iter()
            .filter(|slot| now.saturating_duration_since(slot.start) < self.config.window)
            .fold((0, 0), |(requests, retries), slot| {
                (requests + slot.requests, retries + slot.retries)
            })
    }

    fn current_slot<'a>(&self, slots: &'a mut VecDeque<Slot>, now: Instant) -> &'a mut Slot {
        while slots
            .front()
            .is_some_and(|slot| now.saturating_duration_since(slot.start) >= self.config.window)
        {
            slots.pop_front();
        }

        let fresh = slots
            .back()
            .is_none_or(|slot| now.saturating_duration_since(slot.start) >= self.slot_len);
        if fresh {
            slots.push_back(Slot {
                start: now,
                requests: 0,
                retries: 0,
            });
        }
        let last = slots.len() - 1;
        &mut slots[last]
    }
}

/// Budget usage inside the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryBudgetStats {
    /// Requests recorded
    pub requests: u64,
    /// Retries spent
    pub retries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn budget(ratio: f64, min: u32) -> RetryBudget {
        RetryBudget::new(RetryBudgetConfig {
            max_retry_ratio: ratio,
            window: Duration::from_secs(10),
            min_retries_per_window: min,
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_allows_low_traffic_retries() {
        let budget = budget(0.0, 2);
        budget.deposit();
        assert!(budget.try_withdraw());
        assert!(budget.try_withdraw());
        assert!(!budget.try_withdraw());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_caps_retries() {
        let budget = budget(0.1, 0);
        for _ in 0..100 {
            budget.deposit();
        }
        let granted = (0..50).filter(|_| budget.try_withdraw()).count();
        assert_eq!(granted, 10);
        assert_eq!(
            budget.stats(),
            RetryBudgetStats {
                requests: 100,
                retries: 10,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_restores_budget() {
        let budget = budget(0.0, 1);
        assert!(budget.try_withdraw());
        assert!(!budget.try_withdraw());

        advance(Duration::from_secs(10)).await;
        assert_eq!(budget.stats().retries, 0);
        assert!(budget.try_withdraw());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_roll_over() {
        let budget = budget(1.0, 0);
        for _ in 0..30 {
            budget.deposit();
            advance(Duration::from_millis(500)).await;
        }
        // 15s elapsed; slots that started within the last 10s count
        assert_eq!(budget.stats().requests, 18);
        assert!(budget.slots.lock().len() <= SLOTS_PER_WINDOW as usize + 1);
    }

    #[test]
    fn test_ratio_out_of_range() {
        let config = RetryBudgetConfig {
            max_retry_ratio: 1.5,
            ..RetryBudgetConfig::default()
        };
        assert!(RetryBudget::new(config).is_err());
        let config = RetryBudgetConfig {
            max_retry_ratio: f64::NAN,
            ..RetryBudgetConfig::default()
        };
        assert!(RetryBudget::new(config).is_err());
    }
}
