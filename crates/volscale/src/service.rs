//! Volume service facade.
//!
//! Bundles the mount coordinator with the remaining per-volume operations a
//! protocol adapter needs: create, remove, list, get and capabilities.

use std::path::PathBuf;

use volscale_common::{VolscaleConfig, VolscaleError, VolscaleResult, VolumeId};

use crate::client::DriverHandle;
use crate::context::RequestContext;
use crate::model::{
    AttachOptions, Capabilities, Scope, UnmountOptions, VolumeFilter, VolumeInfo, VolumeLocator,
    VolumeSource, VolumeSpec,
};
use crate::mount::{MountCoordinator, volume_by_name};

/// Entry point for every volume request handled on this node.
///
/// Cheap to clone; each request runs independently and shares only the
/// driver handle.
#[derive(Debug, Clone)]
pub struct VolumeService {
    handle: DriverHandle,
    coordinator: MountCoordinator,
    config: VolscaleConfig,
}

impl VolumeService {
    /// Service over a shared driver handle.
    #[must_use]
    pub fn new(handle: DriverHandle, config: VolscaleConfig) -> Self {
        Self {
            coordinator: MountCoordinator::new(handle.clone(), config.clone()),
            handle,
            config,
        }
    }

    /// The configuration this service runs with.
    #[must_use]
    pub const fn config(&self) -> &VolscaleConfig {
        &self.config
    }

    /// A fresh request context honouring the configured timeout.
    #[must_use]
    pub fn context(&self) -> RequestContext {
        RequestContext::with_optional_timeout(self.config.request_timeout)
    }

    /// Create a logical volume, cloning `source.parent` when set.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name is taken, or the backend error.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        name: &str,
        spec: VolumeSpec,
        source: Option<VolumeSource>,
    ) -> VolscaleResult<VolumeId> {
        let driver = self.handle.get(ctx).await?;
        let locator = VolumeLocator {
            name: name.to_string(),
            labels: spec.labels.clone(),
        };
        let source = source.filter(|s| s.parent.is_some());

        let id = ctx
            .call(driver.create(&locator, source.as_ref(), &spec))
            .await
            .inspect_err(|e| tracing::warn!(volume = %name, error = %e, "Cannot create volume"))?;
        tracing::info!(volume = %name, id = %id, scale = spec.scale, "Volume created");
        Ok(id)
    }

    /// Delete a logical volume by name.
    ///
    /// Replicas of a scaled volume are separate volumes and are not touched.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name, or the backend error.
    pub async fn remove(&self, ctx: &RequestContext, name: &str) -> VolscaleResult<()> {
        let driver = self.handle.get(ctx).await?;
        let volume = volume_by_name(ctx, driver.as_ref(), name).await?;
        ctx.call(driver.delete(&volume.id)).await?;
        tracing::info!(volume = %name, id = %volume.id, "Volume removed");
        Ok(())
    }

    /// Mount a logical volume. See [`MountCoordinator::mount`].
    ///
    /// # Errors
    ///
    /// As for [`MountCoordinator::mount`].
    pub async fn mount(
        &self,
        ctx: &RequestContext,
        name: &str,
        options: &AttachOptions,
    ) -> VolscaleResult<PathBuf> {
        self.coordinator.mount(ctx, name, options).await
    }

    /// Unmount a logical volume. See [`MountCoordinator::unmount`].
    ///
    /// # Errors
    ///
    /// As for [`MountCoordinator::unmount`].
    pub async fn unmount(
        &self,
        ctx: &RequestContext,
        name: &str,
        options: &UnmountOptions,
    ) -> VolscaleResult<()> {
        self.coordinator.unmount(ctx, name, options).await
    }

    /// Where a logical volume is mounted.
    ///
    /// # Errors
    ///
    /// As for [`MountCoordinator::resolve_mountpoint`].
    pub async fn resolve_mountpoint(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> VolscaleResult<PathBuf> {
        self.coordinator.resolve_mountpoint(ctx, name).await
    }

    /// Every volume the backend knows, with its mount path if mounted.
    ///
    /// # Errors
    ///
    /// Returns the backend enumeration error.
    pub async fn list(&self, ctx: &RequestContext) -> VolscaleResult<Vec<VolumeInfo>> {
        let driver = self.handle.get(ctx).await?;
        let volumes = ctx.call(driver.enumerate(&VolumeFilter::default())).await?;

        let mut infos = Vec::with_capacity(volumes.len());
        for volume in volumes {
            // Re-inspect: the volume may have been removed since enumeration.
            match ctx.call(driver.inspect(&volume.id)).await {
                Ok(volume) => infos.push(VolumeInfo {
                    mountpoint: volume.attach_path.first().cloned(),
                    name: volume.locator.name,
                }),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::debug!(id = %volume.id, error = %e, "Skipping volume");
                }
            }
        }
        Ok(infos)
    }

    /// One volume by name.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name, or the backend error.
    pub async fn get(&self, ctx: &RequestContext, name: &str) -> VolscaleResult<VolumeInfo> {
        let driver = self.handle.get(ctx).await?;
        let volume = volume_by_name(ctx, driver.as_ref(), name)
            .await
            .inspect_err(|e| {
                if let VolscaleError::NotFound { .. } = e {
                    tracing::warn!(volume = %name, "Failed to locate volume");
                }
            })?;
        Ok(VolumeInfo {
            name: name.to_string(),
            mountpoint: volume.attach_path.first().cloned(),
        })
    }

    /// Capabilities advertised to callers.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: Scope::Global,
        }
    }
}
