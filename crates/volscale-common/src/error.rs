//! Common error types for volscale.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VolscaleError`].
pub type VolscaleResult<T> = Result<T, VolscaleError>;

/// Errors surfaced by the orchestration layer.
#[derive(Error, Diagnostic, Debug)]
pub enum VolscaleError {
    /// Logical volume or replica does not exist.
    #[error("Volume not found: {name}")]
    #[diagnostic(code(volscale::volume::not_found))]
    NotFound {
        /// Name or id that was looked up.
        name: String,
    },

    /// A volume with this name already exists.
    #[error("Volume already exists: {name}")]
    #[diagnostic(code(volscale::volume::already_exists))]
    AlreadyExists {
        /// The conflicting name.
        name: String,
    },

    /// The volume is attached on a different node.
    #[error("Volume {name} is attached on a remote node")]
    #[diagnostic(
        code(volscale::attach::remote),
        help("Unmount the volume on the other node, or raise its scale")
    )]
    AttachedElsewhere {
        /// The volume that could not be attached.
        name: String,
    },

    /// No replica could be attached or created within the volume's scale.
    #[error("Volume {name} already attached (scale {scale} exhausted)")]
    #[diagnostic(
        code(volscale::attach::scale_exhausted),
        help("Every replica is attached elsewhere; increase the scale to add replicas")
    )]
    AttachExhausted {
        /// Logical volume name.
        name: String,
        /// Configured scale.
        scale: u32,
    },

    /// Transport or connection failure talking to the backend.
    #[error("Backend unavailable: {message}")]
    #[diagnostic(
        code(volscale::backend::unavailable),
        help("The request can be retried once the backend is reachable")
    )]
    BackendUnavailable {
        /// The error message.
        message: String,
    },

    /// A previous occupant of the mount path could not be torn down.
    #[error("Cannot remount scaled volume({name}). Volume {replica} is mounted at {}", .path.display())]
    #[diagnostic(
        code(volscale::mount::inconsistent),
        help("Unmount and detach the listed replica manually before retrying")
    )]
    InconsistentState {
        /// Logical volume name.
        name: String,
        /// Replica id still occupying the path.
        replica: String,
        /// The mount path.
        path: PathBuf,
    },

    /// Nothing is mounted for the logical volume.
    #[error("Volume not mounted: {name}")]
    #[diagnostic(code(volscale::mount::not_mounted))]
    NotMounted {
        /// Logical volume name.
        name: String,
    },

    /// Any other backend failure.
    #[error("Backend error: {message}")]
    #[diagnostic(code(volscale::backend))]
    Backend {
        /// The error message.
        message: String,
    },

    /// The request was cancelled by its caller.
    #[error("Request cancelled")]
    #[diagnostic(code(volscale::cancelled))]
    Cancelled,

    /// The request deadline elapsed before the backend answered.
    #[error("Request deadline exceeded")]
    #[diagnostic(code(volscale::deadline))]
    DeadlineExceeded,

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(volscale::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(volscale::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(volscale::internal),
        help("This is a bug, please report it at https://github.com/volscale/volscale/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl VolscaleError {
    /// Whether the error came from the caller's cancellation or deadline.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Whether the volume, or its mount binding, does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotMounted { .. })
    }
}

impl From<serde_json::Error> for VolscaleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
