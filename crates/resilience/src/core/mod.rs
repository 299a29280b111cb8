//! Core types shared by every pattern
//!
//! Error types, configuration validation, outcome counters and the per-call
//! context live here so the patterns can stay independent of each other.

pub mod cancellation;
pub mod config;
pub mod error;
pub mod metrics;

pub use cancellation::CallContext;
pub use config::{ConfigError, ConfigResult, ExecutorConfig, ResilienceConfig};
pub use error::{ErrorKind, ExhaustionReason, ResilienceError, TimeoutStage};
pub use metrics::{CounterSnapshot, PatternCounters};

/// Result type for guarded calls
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;
