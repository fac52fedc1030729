//! Backend volume driver interface.
//!
//! The backend is the single source of truth for volume existence, attach
//! state and mount bindings. The orchestrator never caches any of it.

mod memory;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use volscale_common::{VolscaleError, VolumeId};

use crate::model::{
    AttachOptions, DriverType, UnmountOptions, Volume, VolumeFilter, VolumeLocator, VolumeSource,
    VolumeSpec,
};

pub use memory::{Fault, MemoryCluster, MemoryDriver};

/// Outcome of a failed backend call.
///
/// `AlreadyExists` and `AttachedOnRemoteNode` drive the selector's
/// retry/continue logic, so they are variants rather than messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// No volume with this name or id.
    #[error("volume {0} not found")]
    NotFound(String),
    /// A volume with this name already exists.
    #[error("volume {0} already exists")]
    AlreadyExists(String),
    /// The volume is attached on another node.
    #[error("volume {0} is attached on a remote node")]
    AttachedOnRemoteNode(String),
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl From<DriverError> for VolscaleError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(name) => Self::NotFound { name },
            DriverError::AlreadyExists(name) => Self::AlreadyExists { name },
            DriverError::AttachedOnRemoteNode(name) => Self::AttachedElsewhere { name },
            DriverError::Unavailable(message) => Self::BackendUnavailable { message },
            DriverError::Other(message) => Self::Backend { message },
        }
    }
}

/// Backend volume service.
///
/// Implementations must be safe for concurrent use by independent requests.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Driver name.
    fn name(&self) -> &str;

    /// Whether volumes are block devices or shared filesystems.
    fn driver_type(&self) -> DriverType;

    /// Create a volume, cloning `source.parent` when set.
    async fn create(
        &self,
        locator: &VolumeLocator,
        source: Option<&VolumeSource>,
        spec: &VolumeSpec,
    ) -> Result<VolumeId, DriverError>;

    /// Delete a volume.
    async fn delete(&self, id: &VolumeId) -> Result<(), DriverError>;

    /// Look up a volume by id.
    async fn inspect(&self, id: &VolumeId) -> Result<Volume, DriverError>;

    /// List volumes matching a filter, in creation order.
    async fn enumerate(&self, filter: &VolumeFilter) -> Result<Vec<Volume>, DriverError>;

    /// Attach a volume to the calling node, returning its device path.
    async fn attach(&self, id: &VolumeId, options: &AttachOptions)
    -> Result<PathBuf, DriverError>;

    /// Detach a volume from the calling node.
    async fn detach(&self, id: &VolumeId) -> Result<(), DriverError>;

    /// Mount a volume at `path`.
    async fn mount(&self, id: &VolumeId, path: &Path) -> Result<(), DriverError>;

    /// Unmount a volume from `path`.
    async fn unmount(
        &self,
        id: &VolumeId,
        path: &Path,
        options: &UnmountOptions,
    ) -> Result<(), DriverError>;

    /// The volume mounted at `path` on the calling node, if any.
    async fn mounted_at(&self, path: &Path) -> Option<VolumeId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_map_onto_taxonomy() {
        let err: VolscaleError = DriverError::AlreadyExists("v_000".into()).into();
        assert!(matches!(err, VolscaleError::AlreadyExists { name } if name == "v_000"));

        let err: VolscaleError = DriverError::AttachedOnRemoteNode("v".into()).into();
        assert!(matches!(err, VolscaleError::AttachedElsewhere { .. }));

        let err: VolscaleError = DriverError::Unavailable("refused".into()).into();
        assert!(matches!(err, VolscaleError::BackendUnavailable { .. }));

        let err: VolscaleError = DriverError::NotFound("v".into()).into();
        assert!(err.is_not_found());
    }
}
