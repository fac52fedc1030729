//! Volume data model shared by the orchestrator and its drivers.
//!
//! Specs, locators and option maps are opaque payloads to the orchestrator:
//! it clones and forwards them, and only reads `scale`, `replica_set` and
//! `passphrase`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use volscale_common::VolumeId;

/// Placeholder node name that backends resolve to the calling node.
pub const LOCAL_NODE: &str = "LocalNode";

/// Label key used to constrain enumeration by data locality.
pub const LOCATION_CONSTRAINT: &str = "LocationConstraint";

/// Attach option carrying the volume's crypto secret.
pub const OPTION_SECRET: &str = "SECRET_KEY";

/// Unmount option asking the backend to clean up the mount path.
pub const OPTION_DELETE_AFTER_UNMOUNT: &str = "DELETE_AFTER_UNMOUNT";

/// Kind of volumes a driver provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    /// Block devices; must be attached before mounting.
    Block,
    /// Shared filesystems; mounted directly.
    File,
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::File => write!(f, "file"),
        }
    }
}

/// Explicit placement constraints for a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    /// Nodes the volume's data is placed on.
    pub nodes: Vec<String>,
}

impl ReplicaSet {
    /// Placement pinned to the calling node.
    #[must_use]
    pub fn local() -> Self {
        Self {
            nodes: vec![LOCAL_NODE.to_string()],
        }
    }
}

/// Desired properties of a logical volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Desired replica count; 1 means "not scaled".
    #[serde(default = "default_scale")]
    pub scale: u32,
    /// Placement constraints.
    #[serde(default)]
    pub replica_set: Option<ReplicaSet>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Filesystem format.
    #[serde(default)]
    pub format: Option<String>,
    /// Crypto passphrase.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Volume labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

const fn default_scale() -> u32 {
    1
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            scale: 1,
            replica_set: None,
            size: 0,
            format: None,
            passphrase: None,
            labels: HashMap::new(),
        }
    }
}

impl VolumeSpec {
    /// Spec with the given scale (0 is treated as 1).
    #[must_use]
    pub fn scaled(scale: u32) -> Self {
        Self::default().with_scale(scale)
    }

    /// Set the scale (0 is treated as 1).
    #[must_use]
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = scale.max(1);
        self
    }

    /// Set the passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Effective scale, never below 1.
    #[must_use]
    pub fn effective_scale(&self) -> u32 {
        self.scale.max(1)
    }

    /// Whether the volume is backed by several replicas.
    #[must_use]
    pub fn is_scaled(&self) -> bool {
        self.scale > 1
    }

    /// Spec for a replica pinned to the calling node.
    #[must_use]
    pub fn for_local_replica(&self) -> Self {
        let mut spec = self.clone();
        spec.scale = 1;
        spec.replica_set = Some(ReplicaSet::local());
        spec
    }

    /// Spec for a replica placed wherever the backend chooses.
    #[must_use]
    pub fn for_scale_up(&self) -> Self {
        let mut spec = self.clone();
        spec.scale = 1;
        spec.replica_set = None;
        spec
    }
}

/// Create-time locator for a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLocator {
    /// Volume name.
    pub name: String,
    /// Volume labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl VolumeLocator {
    /// Locator with just a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
        }
    }
}

/// Clone source for volume creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSource {
    /// Parent volume to clone from.
    pub parent: Option<VolumeId>,
}

/// Enumeration filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    /// Anchored regex the volume name must match.
    pub name_pattern: Option<String>,
    /// Labels the volume must carry.
    pub labels: HashMap<String, String>,
}

impl VolumeFilter {
    /// Match names against a regex.
    #[must_use]
    pub fn name_matching(pattern: impl Into<String>) -> Self {
        Self {
            name_pattern: Some(pattern.into()),
            labels: HashMap::new(),
        }
    }

    /// Restrict to volumes whose data is local to the calling node.
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.labels
            .insert(LOCATION_CONSTRAINT.to_string(), LOCAL_NODE.to_string());
        self
    }

    /// Whether the filter asks for node-local volumes.
    #[must_use]
    pub fn wants_local(&self) -> bool {
        self.labels
            .get(LOCATION_CONSTRAINT)
            .is_some_and(|v| v == LOCAL_NODE)
    }
}

/// Attach state relative to the calling node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachState {
    /// Not attached anywhere.
    Detached,
    /// Attached on the calling node.
    AttachedLocal,
    /// Attached on another node.
    AttachedRemote,
}

impl std::fmt::Display for AttachState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detached => write!(f, "detached"),
            Self::AttachedLocal => write!(f, "attached-local"),
            Self::AttachedRemote => write!(f, "attached-remote"),
        }
    }
}

/// A physical volume instance as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Backend ID.
    pub id: VolumeId,
    /// Locator the volume was created with.
    pub locator: VolumeLocator,
    /// Spec the volume was created with.
    pub spec: VolumeSpec,
    /// Clone parent, if any.
    #[serde(default)]
    pub parent: Option<VolumeId>,
    /// Attach state as seen from the calling node.
    pub attach_state: AttachState,
    /// Node the volume is attached on.
    #[serde(default)]
    pub attached_on: Option<String>,
    /// Device path while attached.
    #[serde(default)]
    pub device_path: Option<PathBuf>,
    /// Paths the volume is mounted at.
    #[serde(default)]
    pub attach_path: Vec<PathBuf>,
    /// Creation timestamp.
    pub created: chrono::DateTime<chrono::Utc>,
}

impl Volume {
    /// Volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.locator.name
    }

    /// Whether the volume is backed by several replicas.
    #[must_use]
    pub fn is_scaled(&self) -> bool {
        self.spec.is_scaled()
    }
}

/// Options passed to the backend attach primitive.
///
/// Built from what the caller supplied on the request, with gaps filled in
/// from the volume's stored spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachOptions(BTreeMap<String, String>);

impl AttachOptions {
    /// Derive attach options from a spec.
    #[must_use]
    pub fn from_spec(spec: &VolumeSpec) -> Self {
        let mut opts = BTreeMap::new();
        if let Some(passphrase) = spec.passphrase.as_deref().filter(|p| !p.is_empty()) {
            opts.insert(OPTION_SECRET.to_string(), passphrase.to_string());
        }
        Self(opts)
    }

    /// Set an option.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Add every option from `defaults` that is not already set.
    #[must_use]
    pub fn fill_from(mut self, defaults: &Self) -> Self {
        for (key, value) in &defaults.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Look up an option.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether no options are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Options passed to the backend unmount primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmountOptions(BTreeMap<String, String>);

impl UnmountOptions {
    /// Ask the backend to clean up the mount path after unmounting.
    #[must_use]
    pub fn delete_after_unmount() -> Self {
        Self::default().with_delete_after_unmount()
    }

    /// These options, plus the request to clean up the mount path.
    #[must_use]
    pub fn with_delete_after_unmount(self) -> Self {
        self.with(OPTION_DELETE_AFTER_UNMOUNT, "true")
    }

    /// Set an option.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up an option.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the mount path should be removed after unmounting.
    #[must_use]
    pub fn deletes_after_unmount(&self) -> bool {
        self.0
            .get(OPTION_DELETE_AFTER_UNMOUNT)
            .is_some_and(|v| v == "true")
    }
}

/// Name and current mount path of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Where the volume is mounted, if anywhere.
    pub mountpoint: Option<PathBuf>,
}

/// Scope in which volume names are unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Names are unique per node.
    Local,
    /// Names are unique across the cluster.
    Global,
}

/// Driver capabilities advertised to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Naming scope.
    pub scope: Scope,
}
