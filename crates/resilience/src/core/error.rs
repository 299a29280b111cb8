//! Error types for resilience operations

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::patterns::circuit_breaker::CircuitState;

/// Errors surfaced by the resilience guards.
///
/// `E` is the error type of the protected operation. Rejections produced by
/// the guards themselves never wrap an `E`; the operation's own error is only
/// ever returned through [`ResilienceError::Operation`] or inside
/// [`ResilienceError::RetryExhausted`].
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// Rate limiter rejected the call before any work started
    RateLimited {
        /// Limiter key that was over quota
        key: String,
        /// Earliest time a retry could be admitted, if known
        retry_after: Option<Duration>,
    },

    /// Bulkhead is saturated and its wait queue is full
    QueueFull {
        /// Maximum concurrent operations
        max_concurrent: usize,
        /// Maximum queued callers
        max_queue_size: usize,
    },

    /// Circuit breaker refused the call
    CircuitOpen {
        /// State the breaker was in when it refused
        state: CircuitState,
        /// Time until the breaker admits a trial call
        retry_after: Option<Duration>,
    },

    /// The operation kept failing until attempts or budget ran out
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Why retrying stopped
        reason: ExhaustionReason,
        /// Last error encountered
        last_error: Box<ResilienceError<E>>,
    },

    /// A deadline or timeout elapsed
    Timeout {
        /// Where the call was when time ran out
        stage: TimeoutStage,
        /// Time spent in that stage
        elapsed: Duration,
    },

    /// The call was cancelled or the guard was shut down
    Cancelled {
        /// Cancellation reason
        reason: String,
    },

    /// The operation itself failed
    Operation(E),
}

/// Why a retry loop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionReason {
    /// `max_attempts` reached
    Attempts,
    /// The shared retry budget denied another retry
    Budget,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempts => write!(f, "attempts exhausted"),
            Self::Budget => write!(f, "retry budget exhausted"),
        }
    }
}

/// Where a call was waiting when its time ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    /// Waiting for a bulkhead slot
    Queue,
    /// Sleeping between retry attempts
    Backoff,
    /// Waiting for an open circuit to admit a trial
    CircuitWait,
    /// A single attempt of the operation ran too long
    Attempt,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queued in bulkhead"),
            Self::Backoff => write!(f, "waiting out retry backoff"),
            Self::CircuitWait => write!(f, "waiting for circuit"),
            Self::Attempt => write!(f, "running attempt"),
        }
    }
}

/// Coarse error taxonomy, used by callers to pick a fallback per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any work started (rate limit, queue full)
    Admission,
    /// Downstream known-unhealthy (circuit open)
    Availability,
    /// Underlying error persisted through all retries
    Exhaustion,
    /// Deadline exceeded while waiting or retrying
    Timeout,
    /// Call cancelled or guard shut down
    Cancelled,
    /// The operation's own error
    Operation,
}

impl<E> ResilienceError<E> {
    /// Create a circuit open error
    #[must_use]
    pub fn circuit_open(state: CircuitState, retry_after: Option<Duration>) -> Self {
        Self::CircuitOpen { state, retry_after }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(stage: TimeoutStage, elapsed: Duration) -> Self {
        Self::Timeout { stage, elapsed }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } | Self::QueueFull { .. } => ErrorKind::Admission,
            Self::CircuitOpen { .. } => ErrorKind::Availability,
            Self::RetryExhausted { .. } => ErrorKind::Exhaustion,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Operation(_) => ErrorKind::Operation,
        }
    }

    /// Whether the call was rejected before the operation ran
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::QueueFull { .. } | Self::CircuitOpen { .. }
        )
    }

    /// Retry delay hint if available
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Borrow the operation's own error, looking through `RetryExhausted`
    #[must_use]
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::RetryExhausted { last_error, .. } => last_error.operation_error(),
            _ => None,
        }
    }

    /// Take the operation's own error, looking through `RetryExhausted`
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::RetryExhausted { last_error, .. } => last_error.into_operation_error(),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { key, retry_after } => {
                write!(f, "Rate limit exceeded for key '{key}'")?;
                if let Some(duration) = retry_after {
                    write!(f, " (retry after {duration:?})")?;
                }
                Ok(())
            }
            Self::QueueFull {
                max_concurrent,
                max_queue_size,
            } => write!(
                f,
                "Bulkhead full: max_concurrent={max_concurrent}, max_queue_size={max_queue_size}"
            ),
            Self::CircuitOpen { state, retry_after } => {
                write!(f, "Circuit breaker is {state}")?;
                if let Some(duration) = retry_after {
                    write!(f, " (retry after {duration:?})")?;
                }
                Ok(())
            }
            Self::RetryExhausted {
                attempts,
                reason,
                last_error,
            } => write!(
                f,
                "Retry gave up after {attempts} attempts ({reason}) - last error: {last_error}"
            ),
            Self::Timeout { stage, elapsed } => {
                write!(f, "Timed out after {elapsed:?} while {stage}")
            }
            Self::Cancelled { reason } => write!(f, "Operation cancelled: {reason}"),
            Self::Operation(err) => write!(f, "Operation failed: {err}"),
        }
    }
}

impl<E> StdError for ResilienceError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Operation(err) => Some(err),
            Self::RetryExhausted { last_error, .. } => Some(last_error.as_ref()),
            _ => None,
        }
    }
}
