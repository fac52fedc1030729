//! Per-request cancellation and deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use volscale_common::{VolscaleError, VolscaleResult};

use crate::driver::DriverError;

/// Cancellation signal and deadline inherited from the caller.
///
/// Every backend call made on behalf of a request goes through
/// [`RequestContext::call`], so a cancelled or expired request stops at the
/// next backend round trip instead of hanging.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context with no deadline that is never cancelled unless asked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Context that expires after `timeout` when one is given.
    #[must_use]
    pub fn with_optional_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::new, Self::with_timeout)
    }

    /// Cancel the request, and every clone of this context with it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the request is already cancelled or expired.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `DeadlineExceeded`.
    pub fn check(&self) -> VolscaleResult<()> {
        if self.cancel.is_cancelled() {
            return Err(VolscaleError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(VolscaleError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run a backend call, aborting on cancellation or deadline.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled`, `DeadlineExceeded`, or the driver error mapped
    /// into the error taxonomy.
    pub async fn call<T, F>(&self, fut: F) -> VolscaleResult<T>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        self.guard(fut).await?.map_err(VolscaleError::from)
    }

    /// Like [`call`](Self::call), but hands the raw driver result back so
    /// the caller can branch on `AlreadyExists` / `AttachedOnRemoteNode`.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `DeadlineExceeded`.
    pub async fn guard<T, F>(&self, fut: F) -> VolscaleResult<T>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(VolscaleError::Cancelled),
            () = expired => Err(VolscaleError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_results() {
        let ctx = RequestContext::new();
        let out = ctx.call(async { Ok::<_, DriverError>(7) }).await.unwrap();
        assert_eq!(out, 7);

        let err = ctx
            .call(async { Err::<(), _>(DriverError::NotFound("v".into())) })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn cancelled_context_aborts() {
        let ctx = RequestContext::new();
        ctx.cancel();
        let err = ctx
            .guard(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, VolscaleError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_slow_call() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, DriverError>(())
        };
        let err = ctx.call(slow).await.unwrap_err();
        assert!(matches!(err, VolscaleError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn clones_share_cancellation() {
        let ctx = RequestContext::new();
        let other = ctx.clone();
        ctx.cancel();
        assert!(matches!(other.check(), Err(VolscaleError::Cancelled)));
    }
}
