//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths::VolscalePaths;

/// Default node name when none is configured.
pub const DEFAULT_NODE: &str = "localhost";

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct VolscaleConfig {
    /// Name of the node this orchestrator runs on.
    pub node_id: String,
    /// Paths for mount data.
    pub paths: VolscalePaths,
    /// Deadline applied to each request, if any.
    pub request_timeout: Option<Duration>,
}

impl Default for VolscaleConfig {
    fn default() -> Self {
        Self {
            node_id: std::env::var("VOLSCALE_NODE").unwrap_or_else(|_| DEFAULT_NODE.to_string()),
            paths: VolscalePaths::new(),
            request_timeout: None,
        }
    }
}

impl VolscaleConfig {
    /// Set the node name.
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Set the mount base directory.
    #[must_use]
    pub fn with_mount_base(mut self, mount_base: impl Into<PathBuf>) -> Self {
        self.paths = VolscalePaths::with_mount_base(mount_base);
        self
    }

    /// Set the per-request deadline.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
