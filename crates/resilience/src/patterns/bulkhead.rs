//! Bulkhead pattern for resource isolation and parallelism limits

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::{
    CallContext, CounterSnapshot, PatternCounters, ResilienceError, TimeoutStage,
    config::{ConfigError, ConfigResult, ResilienceConfig, non_zero_duration},
};

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkheadConfig {
    /// Maximum number of concurrent operations
    pub max_concurrent: usize,
    /// Maximum number of operations waiting for a slot
    pub max_queue_size: usize,
    /// Longest a caller may wait in the queue
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub queue_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            queue_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl BulkheadConfig {
    /// Configuration with the given concurrency and queue bounds
    #[must_use]
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self {
            max_concurrent,
            max_queue_size,
            ..Self::default()
        }
    }

    /// Set the queue timeout
    #[must_use = "builder methods must be chained or built"]
    pub fn with_queue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

impl ResilienceConfig for BulkheadConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::validation(
                "max_concurrent",
                "must be greater than 0",
            ));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::validation(
                "max_concurrent",
                format!("must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        if let Some(timeout) = self.queue_timeout {
            non_zero_duration("queue_timeout", timeout)?;
        }
        Ok(())
    }
}

/// Bulkhead implementation for resource isolation
///
/// Slots are handed out by tokio's fair semaphore, so queued callers are
/// admitted in arrival order.
#[derive(Debug)]
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    counters: PatternCounters,
}

impl Bulkhead {
    /// Create a new bulkhead, validating the configuration
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    pub(crate) fn from_valid(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            queued: AtomicUsize::new(0),
            counters: PatternCounters::new(),
            config,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Operations currently holding a slot
    #[must_use]
    pub fn running(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Callers currently waiting for a slot
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Try to acquire a slot without waiting
    #[must_use]
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(BulkheadPermit { _permit: permit })
    }

    /// Acquire a slot, queueing if every slot is taken.
    ///
    /// Fails with `QueueFull` when the queue is at capacity, `Timeout` when
    /// the queue timeout or the context deadline passes first, and
    /// `Cancelled` when the context is cancelled or the bulkhead closes.
    pub async fn acquire<E>(&self, ctx: &CallContext) -> Result<BulkheadPermit, ResilienceError<E>> {
        self.counters.record_call();

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::Closed) => {
                self.counters.record_rejection();
                return Err(ResilienceError::cancelled("bulkhead closed"));
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let Some(_slot) = self.reserve_queue_slot() else {
            self.counters.record_rejection();
            debug!(
                max_concurrent = self.config.max_concurrent,
                max_queue_size = self.config.max_queue_size,
                "Bulkhead queue full"
            );
            return Err(ResilienceError::QueueFull {
                max_concurrent: self.config.max_concurrent,
                max_queue_size: self.config.max_queue_size,
            });
        };

        debug!(queued = self.queued(), "Waiting for bulkhead slot");
        let started = Instant::now();
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let waited = ctx
            .guard(TimeoutStage::Queue, async {
                match self.config.queue_timeout {
                    Some(limit) => tokio::time::timeout(limit, acquire).await.ok(),
                    None => Some(acquire.await),
                }
            })
            .await;

        match waited {
            Ok(Some(Ok(permit))) => Ok(BulkheadPermit { _permit: permit }),
            Ok(Some(Err(_closed))) => {
                self.counters.record_rejection();
                Err(ResilienceError::cancelled("bulkhead closed"))
            }
            Ok(None) => {
                self.counters.record_rejection();
                Err(ResilienceError::timeout(TimeoutStage::Queue, started.elapsed()))
            }
            Err(err) => {
                self.counters.record_rejection();
                Err(err)
            }
        }
    }

    /// Execute an operation with bulkhead protection
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.execute_with(&CallContext::new(), operation).await
    }

    /// Execute an operation, bounding the queue wait by `ctx`
    #[tracing::instrument(skip_all, fields(pattern = "bulkhead"))]
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let _permit = self.acquire(ctx).await?;
        debug!(running = self.running(), "Bulkhead operation started");

        let result = operation().await;
        match &result {
            Ok(_) => self.counters.record_success(),
            Err(_) => self.counters.record_failure(),
        }
        result
    }

    /// Stop admitting callers.
    ///
    /// Queued callers fail with `Cancelled`; running operations keep their
    /// slots until they finish.
    pub fn close(&self) {
        if !self.semaphore.is_closed() {
            info!(
                running = self.running(),
                queued = self.queued(),
                "Closing bulkhead"
            );
            self.semaphore.close();
        }
    }

    /// Outcome counters
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Get bulkhead statistics
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            max_concurrent: self.config.max_concurrent,
            max_queue_size: self.config.max_queue_size,
            running: self.running(),
            queued: self.queued(),
            closed: self.is_closed(),
            counters: self.counters.snapshot(),
        }
    }

    fn reserve_queue_slot(&self) -> Option<QueueSlot<'_>> {
        let limit = self.config.max_queue_size;
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < limit).then_some(queued + 1)
            })
            .ok()?;
        Some(QueueSlot {
            queued: &self.queued,
        })
    }
}

struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Slot held for the duration of one operation; released on drop
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bulkhead statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    /// Maximum concurrency limit
    pub max_concurrent: usize,
    /// Queue capacity
    pub max_queue_size: usize,
    /// Operations currently running
    pub running: usize,
    /// Callers currently waiting
    pub queued: usize,
    /// Whether the bulkhead has been closed
    pub closed: bool,
    /// Outcome counters
    pub counters: CounterSnapshot,
}
