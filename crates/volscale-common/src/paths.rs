//! Standard filesystem paths for volscale.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default base directory under which logical volumes are mounted.
pub static VOLSCALE_MOUNT_BASE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("VOLSCALE_MOUNT_BASE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/volscale/mounts"))
});

/// Standard paths used by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolscalePaths {
    /// Mount base directory (default: /var/lib/volscale/mounts).
    pub mount_base: PathBuf,
}

impl VolscalePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom mount base.
    #[must_use]
    pub fn with_mount_base(mount_base: impl Into<PathBuf>) -> Self {
        Self {
            mount_base: mount_base.into(),
        }
    }

    /// Canonical mount path for a logical volume.
    ///
    /// Always derived from the logical name, never from a replica name, so
    /// callers see one stable path whichever replica backs the volume.
    #[must_use]
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.mount_base.join(name)
    }

    /// The mount base directory.
    #[must_use]
    pub fn mount_base(&self) -> &Path {
        &self.mount_base
    }
}

impl Default for VolscalePaths {
    fn default() -> Self {
        Self {
            mount_base: VOLSCALE_MOUNT_BASE.clone(),
        }
    }
}
