//! Configuration types and validation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::patterns::bulkhead::BulkheadConfig;
use crate::patterns::circuit_breaker::CircuitBreakerConfig;
use crate::patterns::rate_limiter::RateLimiterConfig;
use crate::patterns::retry::{RetryBudgetConfig, RetryConfig};

/// Configuration errors. Raised at construction time, never at call time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value the pattern cannot work with
    #[error("invalid configuration for `{field}`: {message}")]
    Validation {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        message: String,
    },

    /// The serialized configuration could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Base configuration trait for resilience patterns
pub trait ResilienceConfig: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone {
    /// Check every field, returning the first violation
    fn validate(&self) -> ConfigResult<()>;

    /// Default configuration for this pattern
    fn default_config() -> Self
    where
        Self: Default,
    {
        Self::default()
    }

    /// Validate and hand the configuration back
    fn validated(self) -> ConfigResult<Self>
    where
        Self: Sized,
    {
        self.validate()?;
        Ok(self)
    }
}

/// Check that a rate is finite and strictly positive
pub(crate) fn positive_rate(field: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::validation(
            field,
            format!("must be a finite positive number, got {value}"),
        ))
    }
}

/// Check that a duration is non-zero
pub(crate) fn non_zero_duration(field: &'static str, value: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        Err(ConfigError::validation(field, "must be greater than 0"))
    } else {
        Ok(())
    }
}

/// Complete configuration of a [`ResilientExecutor`](crate::ResilientExecutor).
///
/// Serialized field names are camelCase; durations use humantime strings
/// such as `"5s"` or `"250ms"` when the `humantime` feature is on.
///
/// ```
/// use bulwark_resilience::ExecutorConfig;
///
/// let config = ExecutorConfig::from_json(r#"{
///     "circuitBreaker": { "failureThreshold": 3, "openTimeout": "5s" },
///     "rateLimiter": { "algorithm": "tokenBucket", "capacity": 10, "refillRate": 1.0 }
/// }"#).unwrap();
/// assert_eq!(config.circuit_breaker.failure_threshold, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    /// Circuit breaker settings, one breaker per key
    pub circuit_breaker: CircuitBreakerConfig,
    /// Bulkhead settings, one bulkhead per key
    pub bulkhead: BulkheadConfig,
    /// Rate limiting algorithm and its parameters
    pub rate_limiter: RateLimiterConfig,
    /// Retry and backoff settings
    pub retry: RetryConfig,
    /// Retry budget shared by every key of the executor
    pub retry_budget: RetryBudgetConfig,
    /// Idle period after which per-key limiter state is evicted
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub idle_eviction: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            retry: RetryConfig::default(),
            retry_budget: RetryBudgetConfig::default(),
            idle_eviction: Some(Duration::from_secs(600)),
        }
    }
}

impl ExecutorConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validated()
    }
}

impl ResilienceConfig for ExecutorConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.circuit_breaker.validate()?;
        self.bulkhead.validate()?;
        self.rate_limiter.validate()?;
        self.retry.validate()?;
        self.retry_budget.validate()?;
        if let Some(idle) = self.idle_eviction {
            non_zero_duration("idle_eviction", idle)?;
        }
        Ok(())
    }
}
