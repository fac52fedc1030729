//! Volume identifiers and replica naming.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque backend volume ID.
///
/// The backend owns the format; the orchestrator only compares and forwards
/// IDs. A replica's ID never changes across attach/detach cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Wrap a backend-issued ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random volume ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the volume ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the ID is empty (backends report "nothing mounted" this way).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VolumeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Name of the replica at `index` for logical volume `base`.
///
/// Replicas are numbered from zero with a three-digit minimum width:
/// `cache_000`, `cache_001`, ... `cache_1000`.
#[must_use]
pub fn replica_name(base: &str, index: usize) -> String {
    format!("{base}_{index:03}")
}

/// Anchored regex matching every replica name of `base` and nothing else.
#[must_use]
pub fn replica_pattern(base: &str) -> String {
    format!("^{}_[0-9]{{3,}}$", regex::escape(base))
}

/// Anchored regex matching exactly `name`.
#[must_use]
pub fn exact_pattern(name: &str) -> String {
    format!("^{}$", regex::escape(name))
}
