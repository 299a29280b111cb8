//! Retry classification for operation errors
//!
//! The retry policy never inspects an error's content. Instead, operation
//! errors implement [`Retryable`] to say which class they belong to.

use std::error::Error;
use std::time::Duration;

use serde::Serialize;

/// Classification of an operation error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Likely to succeed if tried again (timeouts, resets, 5xx-style)
    Transient,
    /// Caused by the request itself (4xx-style); retrying cannot help
    Client,
    /// Will not change on retry for any other reason
    Permanent,
}

/// Trait for errors that support retry logic
///
/// # Examples
///
/// ```
/// use bulwark_resilience::{ErrorClass, Retryable};
/// use thiserror::Error;
///
/// #[derive(Error, Debug)]
/// pub enum ApiError {
///     #[error("upstream returned {0}")]
///     Status(u16),
///     #[error("connection reset")]
///     Reset,
/// }
///
/// impl Retryable for ApiError {
///     fn class(&self) -> ErrorClass {
///         match self {
///             Self::Status(code) if (400..500).contains(code) => ErrorClass::Client,
///             _ => ErrorClass::Transient,
///         }
///     }
/// }
///
/// assert!(!ApiError::Status(404).is_retryable());
/// assert!(ApiError::Status(503).is_retryable());
/// ```
pub trait Retryable: Error {
    /// Class of this error
    ///
    /// Default: [`ErrorClass::Transient`]
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }

    /// Check if this error can be retried. Only transient errors can.
    fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Minimum delay requested by the error itself (e.g. a `Retry-After`)
    ///
    /// Default: `None` (use the computed backoff)
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// `std::io::Error` is retryable for connection-level error kinds
impl Retryable for std::io::Error {
    fn class(&self) -> ErrorClass {
        use std::io::ErrorKind::{
            ConnectionAborted, ConnectionRefused, ConnectionReset, InvalidData, InvalidInput,
            Interrupted, NotFound, PermissionDenied, TimedOut, WouldBlock,
        };
        match self.kind() {
            Interrupted | WouldBlock | TimedOut | ConnectionReset | ConnectionAborted
            | ConnectionRefused => ErrorClass::Transient,
            InvalidInput | InvalidData | NotFound | PermissionDenied => ErrorClass::Client,
            _ => ErrorClass::Permanent,
        }
    }
}

/// `fmt::Error` is not retryable
impl Retryable for std::fmt::Error {
    fn class(&self) -> ErrorClass {
        ErrorClass::Permanent
    }
}
