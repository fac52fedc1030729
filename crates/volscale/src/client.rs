//! Lazily connected, shared backend driver handle.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use volscale_common::{VolscaleError, VolscaleResult};

use crate::context::RequestContext;
use crate::driver::{DriverError, VolumeDriver};

/// Establishes the connection to the backend volume service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection.
    async fn connect(&self) -> Result<Arc<dyn VolumeDriver>, DriverError>;
}

/// Connector that hands out an already constructed driver.
struct Ready(Arc<dyn VolumeDriver>);

#[async_trait]
impl Connector for Ready {
    async fn connect(&self) -> Result<Arc<dyn VolumeDriver>, DriverError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Shared handle to the backend, connected on first use.
///
/// Concurrent first use connects exactly once; a failed connect leaves the
/// handle empty so the next request tries again. Once connected the driver
/// is shared by every request without further locking.
#[derive(Clone)]
pub struct DriverHandle {
    connector: Arc<dyn Connector>,
    driver: Arc<OnceCell<Arc<dyn VolumeDriver>>>,
}

impl DriverHandle {
    /// Handle that connects through `connector` on first use.
    #[must_use]
    pub fn lazy(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Arc::new(connector),
            driver: Arc::new(OnceCell::new()),
        }
    }

    /// Handle around a driver that needs no connection step.
    #[must_use]
    pub fn ready(driver: Arc<dyn VolumeDriver>) -> Self {
        Self {
            connector: Arc::new(Ready(Arc::clone(&driver))),
            driver: Arc::new(OnceCell::new_with(Some(driver))),
        }
    }

    /// Whether the backend connection has been established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.driver.initialized()
    }

    /// The connected driver, connecting if needed.
    ///
    /// The connect attempt is bounded by `ctx`; an abandoned attempt leaves
    /// the handle unconnected for the next request.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the connection cannot be established,
    /// or `Cancelled` / `DeadlineExceeded` if `ctx` ends first.
    pub async fn get(&self, ctx: &RequestContext) -> VolscaleResult<Arc<dyn VolumeDriver>> {
        let connect = self.driver.get_or_try_init(|| async {
            tracing::debug!("Connecting to volume backend");
            self.connector.connect().await.map_err(|e| {
                tracing::warn!(error = %e, "Failed to connect to volume backend");
                VolscaleError::BackendUnavailable {
                    message: format!("Failed to connect to volume backend: {e}"),
                }
            })
        });
        ctx.guard(connect).await?.map(Arc::clone)
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::driver::MemoryCluster;
    use crate::model::DriverType;

    struct CountingConnector {
        cluster: MemoryCluster,
        attempts: Arc<AtomicUsize>,
        fail_first: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self) -> Result<Arc<dyn VolumeDriver>, DriverError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_first && attempt == 0 {
                return Err(DriverError::Unavailable("refused".into()));
            }
            Ok(Arc::new(self.cluster.driver("n1")))
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let handle = DriverHandle::lazy(CountingConnector {
            cluster: MemoryCluster::new(DriverType::Block),
            attempts: Arc::clone(&attempts),
            fail_first: false,
        });

        let gets = (0..8).map(|_| {
            let handle = handle.clone();
            async move { handle.get(&RequestContext::new()).await.map(|_| ()) }
        });
        for res in futures::future::join_all(gets).await {
            assert!(res.is_ok());
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let handle = DriverHandle::lazy(CountingConnector {
            cluster: MemoryCluster::new(DriverType::Block),
            attempts: Arc::clone(&attempts),
            fail_first: true,
        });

        let ctx = RequestContext::new();
        let err = handle.get(&ctx).await.err().unwrap();
        assert!(matches!(err, VolscaleError::BackendUnavailable { .. }));
        assert!(!handle.is_connected());

        assert!(handle.get(&ctx).await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ready_handle_is_connected() {
        let cluster = MemoryCluster::new(DriverType::File);
        let handle = DriverHandle::ready(Arc::new(cluster.driver("n1")));
        assert!(handle.is_connected());
        let driver = handle.get(&RequestContext::new()).await.unwrap();
        assert_eq!(driver.name(), "memory");
    }

    struct Hang;

    #[async_trait]
    impl Connector for Hang {
        async fn connect(&self) -> Result<Arc<dyn VolumeDriver>, DriverError> {
            std::future::pending::<Result<Arc<dyn VolumeDriver>, DriverError>>().await
        }
    }

    #[tokio::test]
    async fn hung_connect_honors_cancellation() {
        let handle = DriverHandle::lazy(Hang);
        let ctx = RequestContext::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = handle.get(&ctx).await.err().unwrap();
        assert!(matches!(err, VolscaleError::Cancelled));
        assert!(!handle.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_honors_deadline() {
        let handle = DriverHandle::lazy(Hang);
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));

        let err = handle.get(&ctx).await.err().unwrap();
        assert!(matches!(err, VolscaleError::DeadlineExceeded));
        assert!(!handle.is_connected());
    }
}
