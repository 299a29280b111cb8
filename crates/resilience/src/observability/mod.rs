//! Observability for resilience patterns
//!
//! Every guard reports through `tracing`: state transitions at `info`/`warn`,
//! per-call decisions at `debug`, and `execute` paths inside spans carrying a
//! `pattern` field. [`init_logging`] installs a subscriber for applications
//! that do not bring their own.

pub mod logging;

pub use logging::{LogConfig, LogError, LogFormat, init_logging};
