//! Per-call deadline and cancellation
//!
//! A [`CallContext`] travels with one call through every guard. Guards use it
//! only at their suspension points (bulkhead queue, retry backoff, circuit
//! wait): the operation itself is never raced against the deadline here.

use std::future::{Future, pending};
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::error::{ResilienceError, TimeoutStage};

/// Deadline and cancellation token for one guarded call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
}

impl CallContext {
    /// Context with no deadline and no cancellation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon waits once `deadline` passes
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Abandon waits once `timeout` has elapsed from now
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Abandon waits when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Drive `fut` until it completes, the deadline passes, or the token fires.
    ///
    /// Completion wins ties, so a wait that finishes exactly at the deadline
    /// still succeeds.
    pub(crate) async fn guard<F, E>(
        &self,
        stage: TimeoutStage,
        fut: F,
    ) -> Result<F::Output, ResilienceError<E>>
    where
        F: Future,
    {
        let started = Instant::now();
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            output = fut => Ok(output),
            () = cancelled => {
                tracing::debug!(%stage, "call cancelled while waiting");
                Err(ResilienceError::cancelled("call cancelled"))
            }
            () = deadline => {
                let elapsed = started.elapsed();
                tracing::debug!(%stage, ?elapsed, "deadline exceeded while waiting");
                Err(ResilienceError::timeout(stage, elapsed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_guard_completes_before_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let result: Result<u32, ResilienceError<()>> = ctx
            .guard(TimeoutStage::Backoff, async {
                sleep(Duration::from_millis(10)).await;
                7
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
        let result: Result<(), ResilienceError<()>> = ctx
            .guard(TimeoutStage::Queue, sleep(Duration::from_secs(10)))
            .await;
        match result {
            Err(ResilienceError::Timeout { stage, elapsed }) => {
                assert_eq!(stage, TimeoutStage::Queue);
                assert_eq!(elapsed, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_cancelled() {
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());

        let result: Result<(), ResilienceError<()>> = ctx
            .guard(TimeoutStage::Backoff, sleep(Duration::from_secs(10)))
            .await;
        assert!(matches!(result, Err(ResilienceError::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_without_deadline() {
        let ctx = CallContext::new();
        assert_eq!(ctx.remaining(), None);
        assert!(!ctx.is_cancelled());

        let ctx = ctx.with_timeout(Duration::from_secs(2));
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(2)));
    }
}
