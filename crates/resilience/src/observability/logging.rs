//! Subscriber setup for the `tracing` events the guards emit

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// Single line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `"info,bulwark_resilience=debug"`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Colored output (ignored for JSON)
    pub ansi: bool,
    /// Include the event target
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Compact,
            ansi: true,
            target: true,
        }
    }
}

impl LogConfig {
    /// Default configuration with the filter taken from `RUST_LOG` when set
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(level) = std::env::var(EnvFilter::DEFAULT_ENV)
            && !level.is_empty()
        {
            config.level = level;
        }
        config
    }
}

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LogError {
    /// Filter directives could not be parsed
    #[error("invalid log filter `{filter}`: {message}")]
    InvalidFilter {
        /// The rejected directives
        filter: String,
        /// Parser message
        message: String,
    },

    /// A global subscriber is already installed
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install a global subscriber for `config`.
///
/// Fails if the filter is malformed or a global subscriber already exists.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter {
        filter: config.level.clone(),
        message: e.to_string(),
    })?;

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.ansi)
            .with_target(config.target)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(config.ansi)
            .with_target(config.target)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(config.target)
            .boxed(),
    };

    Registry::default()
        .with(output)
        .with(filter)
        .try_init()
        .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}
