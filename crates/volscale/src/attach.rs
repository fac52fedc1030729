//! Attach orchestrator.
//!
//! A thin wrapper over the backend attach primitive that classifies the
//! outcome. It never retries; the replica selector decides whether a failed
//! candidate ends the request or moves on to the next one.

use std::path::PathBuf;

use volscale_common::{VolscaleError, VolscaleResult};

use crate::context::RequestContext;
use crate::driver::{DriverError, VolumeDriver};
use crate::model::{AttachOptions, Volume};

/// Classified result of one attach attempt.
#[derive(Debug)]
pub enum AttachOutcome {
    /// The volume is attached on this node.
    Attached {
        /// The volume.
        volume: Volume,
        /// Device path reported by the backend.
        device: PathBuf,
    },
    /// The volume is attached on another node.
    AttachedElsewhere(Volume),
    /// Any other attach failure.
    Failed(Volume, VolscaleError),
}

impl AttachOutcome {
    /// The volume the attempt was made for.
    #[must_use]
    pub const fn volume(&self) -> &Volume {
        match self {
            Self::Attached { volume, .. } | Self::AttachedElsewhere(volume) | Self::Failed(volume, _) => {
                volume
            }
        }
    }

    /// Whether the volume ended up attached here.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }

    /// Treat anything but success as an error.
    ///
    /// # Errors
    ///
    /// `AttachedElsewhere` for a remote attachment, otherwise the backend error.
    pub fn into_result(self) -> VolscaleResult<Volume> {
        match self {
            Self::Attached { volume, .. } => Ok(volume),
            Self::AttachedElsewhere(volume) => Err(VolscaleError::AttachedElsewhere {
                name: volume.locator.name,
            }),
            Self::Failed(_, err) => Err(err),
        }
    }
}

/// Attach `volume` to the calling node and classify the result.
///
/// # Errors
///
/// Only cancellation and deadline errors are returned as `Err`; every backend
/// outcome is reported through [`AttachOutcome`].
pub async fn attach(
    ctx: &RequestContext,
    driver: &dyn VolumeDriver,
    volume: Volume,
    options: &AttachOptions,
) -> VolscaleResult<AttachOutcome> {
    let result = ctx.guard(driver.attach(&volume.id, options)).await?;
    let name = volume.name().to_string();

    Ok(match result {
        Ok(device) => {
            tracing::debug!(volume = %name, device = %device.display(), "Volume attached");
            AttachOutcome::Attached { volume, device }
        }
        Err(DriverError::AttachedOnRemoteNode(_)) => {
            tracing::info!(volume = %name, "Volume attached on remote node");
            AttachOutcome::AttachedElsewhere(volume)
        }
        Err(e) => {
            tracing::warn!(volume = %name, error = %e, "Cannot attach volume");
            AttachOutcome::Failed(volume, e.into())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Fault, MemoryCluster};
    use crate::model::{DriverType, VolumeLocator, VolumeSpec};

    async fn volume(cluster: &MemoryCluster, node: &str, name: &str) -> Volume {
        let driver = cluster.driver(node);
        let id = driver
            .create(&VolumeLocator::named(name), None, &VolumeSpec::default())
            .await
            .unwrap();
        driver.inspect(&id).await.unwrap()
    }

    #[tokio::test]
    async fn success_returns_volume_unchanged() {
        let cluster = MemoryCluster::new(DriverType::Block);
        let vol = volume(&cluster, "a", "v").await;
        let ctx = RequestContext::new();

        let outcome = attach(&ctx, &cluster.driver("a"), vol.clone(), &AttachOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_attached());
        assert_eq!(outcome.volume().id, vol.id);
    }

    #[tokio::test]
    async fn remote_attachment_is_classified() {
        let cluster = MemoryCluster::new(DriverType::Block);
        let vol = volume(&cluster, "a", "v").await;
        let ctx = RequestContext::new();
        let opts = AttachOptions::default();
        attach(&ctx, &cluster.driver("a"), vol.clone(), &opts)
            .await
            .unwrap();

        let outcome = attach(&ctx, &cluster.driver("b"), vol, &opts).await.unwrap();
        assert!(matches!(outcome, AttachOutcome::AttachedElsewhere(_)));
        assert!(matches!(
            outcome.into_result(),
            Err(VolscaleError::AttachedElsewhere { .. })
        ));
    }

    #[tokio::test]
    async fn other_failures_keep_the_error() {
        let cluster = MemoryCluster::new(DriverType::Block);
        let vol = volume(&cluster, "a", "v").await;
        cluster.fail_next(Fault::Attach);

        let outcome = attach(
            &RequestContext::new(),
            &cluster.driver("a"),
            vol,
            &AttachOptions::default(),
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            AttachOutcome::Failed(_, VolscaleError::Backend { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_is_an_error() {
        let cluster = MemoryCluster::new(DriverType::Block);
        let vol = volume(&cluster, "a", "v").await;
        let ctx = RequestContext::new();
        ctx.cancel();

        let err = attach(&ctx, &cluster.driver("a"), vol, &AttachOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
