//! Mount coordinator.
//!
//! Resolves a logical volume name to the replica that should back it on this
//! node, tears down whatever previously occupied the canonical mount path,
//! and mounts the result. Mount bindings are always re-read from the backend;
//! nothing is cached between requests.
//!
//! Partially completed mounts are not rolled back: a replica attached before
//! a failed mount stays attached until a retry or an explicit unmount.

use std::path::{Path, PathBuf};

use volscale_common::{VolscaleConfig, VolscaleError, VolscaleResult, VolumeId, exact_pattern};

use crate::client::DriverHandle;
use crate::context::RequestContext;
use crate::driver::VolumeDriver;
use crate::model::{AttachOptions, DriverType, UnmountOptions, Volume, VolumeFilter};
use crate::selector::ReplicaSelector;

/// Phases a mount request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPhase {
    /// Looking up the logical volume and clearing the mount path.
    Resolving,
    /// Selecting and attaching a replica (block drivers only).
    Attaching,
    /// Mounting at the canonical path.
    Mounting,
    /// Mounted.
    Mounted,
}

impl std::fmt::Display for MountPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolving => write!(f, "resolving"),
            Self::Attaching => write!(f, "attaching"),
            Self::Mounting => write!(f, "mounting"),
            Self::Mounted => write!(f, "mounted"),
        }
    }
}

/// Look up a volume by exact name.
///
/// # Errors
///
/// `NotFound` if no volume has that name, or the backend error.
pub async fn volume_by_name(
    ctx: &RequestContext,
    driver: &dyn VolumeDriver,
    name: &str,
) -> VolscaleResult<Volume> {
    ctx.call(driver.enumerate(&VolumeFilter::name_matching(exact_pattern(name))))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| VolscaleError::NotFound {
            name: name.to_string(),
        })
}

/// Top-level mount/unmount entry point.
#[derive(Debug, Clone)]
pub struct MountCoordinator {
    handle: DriverHandle,
    config: VolscaleConfig,
}

impl MountCoordinator {
    /// Coordinator over a shared driver handle.
    #[must_use]
    pub const fn new(handle: DriverHandle, config: VolscaleConfig) -> Self {
        Self { handle, config }
    }

    /// Canonical mount path for a logical volume.
    #[must_use]
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.config.paths.mountpoint(name)
    }

    /// Mount a logical volume and return its canonical mount path.
    ///
    /// The path is derived from the logical name even when a freshly created
    /// replica backs it. Attach options the caller supplies take precedence;
    /// anything they leave out comes from the volume's stored spec.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown volume, `InconsistentState` if a previous
    /// occupant of the path cannot be torn down, the selector's errors for
    /// block volumes, or the backend mount error.
    pub async fn mount(
        &self,
        ctx: &RequestContext,
        name: &str,
        options: &AttachOptions,
    ) -> VolscaleResult<PathBuf> {
        let driver = self.handle.get(ctx).await?;
        let driver = driver.as_ref();

        tracing::debug!(volume = %name, phase = %MountPhase::Resolving, "Mount");
        let mut volume = volume_by_name(ctx, driver, name).await?;
        let options = options
            .clone()
            .fill_from(&AttachOptions::from_spec(&volume.spec));
        let mountpoint = self.mountpoint(name);

        if volume.is_scaled() {
            if let Some(occupant) = ctx.guard(driver.mounted_at(&mountpoint)).await? {
                if !occupant.is_empty() {
                    release_occupant(ctx, driver, name, &occupant, &mountpoint).await?;
                }
            }
        }

        if driver.driver_type() == DriverType::Block {
            tracing::debug!(volume = %name, phase = %MountPhase::Attaching, "Mount");
            volume = ReplicaSelector::new(ctx, driver)
                .select_for_attach(volume, &options)
                .await?;
        }

        tracing::debug!(
            volume = %name,
            replica = %volume.name(),
            phase = %MountPhase::Mounting,
            "Mount"
        );
        tokio::fs::create_dir_all(&mountpoint).await?;
        if let Err(e) = ctx.call(driver.mount(&volume.id, &mountpoint)).await {
            tracing::warn!(
                volume = %name,
                path = %mountpoint.display(),
                error = %e,
                "Cannot mount volume"
            );
            return Err(e);
        }

        tracing::info!(
            volume = %name,
            replica = %volume.name(),
            path = %mountpoint.display(),
            phase = %MountPhase::Mounted,
            "Volume mounted"
        );
        Ok(mountpoint)
    }

    /// Unmount a logical volume and, for block volumes, detach it.
    ///
    /// The caller's options are passed to the backend with the request to
    /// clean up the mount path added. Detach after a successful unmount is
    /// best effort and only logged.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown volume, `NotMounted` when a scaled volume
    /// has nothing at its mount path, or the backend unmount error.
    pub async fn unmount(
        &self,
        ctx: &RequestContext,
        name: &str,
        options: &UnmountOptions,
    ) -> VolscaleResult<()> {
        let driver = self.handle.get(ctx).await?;
        let driver = driver.as_ref();

        let volume = volume_by_name(ctx, driver, name).await?;
        let mountpoint = self.mountpoint(name);

        let id = if volume.is_scaled() {
            match ctx.guard(driver.mounted_at(&mountpoint)).await? {
                Some(id) if !id.is_empty() => id,
                _ => {
                    tracing::warn!(
                        volume = %name,
                        path = %mountpoint.display(),
                        "Cannot unmount volume, no replica mapped at mount path"
                    );
                    return Err(VolscaleError::NotMounted {
                        name: name.to_string(),
                    });
                }
            }
        } else {
            volume.id
        };

        let options = options.clone().with_delete_after_unmount();
        if let Err(e) = ctx.call(driver.unmount(&id, &mountpoint, &options)).await {
            tracing::warn!(
                volume = %name,
                path = %mountpoint.display(),
                error = %e,
                "Cannot unmount volume"
            );
            return Err(e);
        }

        if driver.driver_type() == DriverType::Block {
            if let Err(e) = ctx.call(driver.detach(&id)).await {
                tracing::warn!(volume = %name, replica = %id, error = %e, "Detach after unmount failed");
            }
        }

        tracing::info!(volume = %name, replica = %id, "Volume unmounted");
        Ok(())
    }

    /// Where a logical volume is currently mounted.
    ///
    /// Read-only: nothing is attached, created or mounted.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown volume, `NotMounted` if it is not mounted.
    pub async fn resolve_mountpoint(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> VolscaleResult<PathBuf> {
        let driver = self.handle.get(ctx).await?;
        let driver = driver.as_ref();

        let volume = volume_by_name(ctx, driver, name).await?;
        let path = if volume.is_scaled() {
            let mountpoint = self.mountpoint(name);
            ctx.guard(driver.mounted_at(&mountpoint))
                .await?
                .filter(|id| !id.is_empty())
                .map(|_| mountpoint)
        } else {
            volume.attach_path.first().cloned()
        };

        path.ok_or_else(|| {
            tracing::debug!(volume = %name, "Volume not mounted");
            VolscaleError::NotMounted {
                name: name.to_string(),
            }
        })
    }
}

/// Unmount (and for block drivers detach) the replica occupying `mountpoint`.
///
/// If detach fails the occupant is mounted again so the path is left as it
/// was found, unless the request has already been cancelled or has expired.
/// Whether that restore worked is only logged.
async fn release_occupant(
    ctx: &RequestContext,
    driver: &dyn VolumeDriver,
    name: &str,
    occupant: &VolumeId,
    mountpoint: &Path,
) -> VolscaleResult<()> {
    let inconsistent = || VolscaleError::InconsistentState {
        name: name.to_string(),
        replica: occupant.to_string(),
        path: mountpoint.to_path_buf(),
    };

    tracing::debug!(volume = %name, replica = %occupant, "Releasing previous mount");
    if let Err(e) = ctx
        .call(driver.unmount(occupant, mountpoint, &UnmountOptions::default()))
        .await
    {
        tracing::warn!(volume = %name, replica = %occupant, error = %e, "Error unmounting scaled volume");
        return Err(inconsistent());
    }

    if driver.driver_type() == DriverType::Block {
        if let Err(e) = ctx.call(driver.detach(occupant)).await {
            tracing::warn!(volume = %name, replica = %occupant, error = %e, "Error detaching scaled volume");
            if let Err(e) = ctx.check() {
                tracing::warn!(
                    volume = %name,
                    replica = %occupant,
                    error = %e,
                    "Skipping remount of scaled volume, request is no longer live"
                );
            } else if let Err(e) = ctx.call(driver.mount(occupant, mountpoint)).await {
                tracing::warn!(
                    volume = %name,
                    replica = %occupant,
                    error = %e,
                    "Error remounting scaled volume"
                );
            }
            let err = inconsistent();
            tracing::warn!(volume = %name, "{err}");
            return Err(err);
        }
    }
    Ok(())
}
