//! # volscale-common
//!
//! Shared utilities and types for the volscale orchestration layer.
//!
//! This crate provides common functionality used across all volscale crates:
//! - Volume ID generation and replica naming
//! - Standard mount paths
//! - Runtime configuration
//! - Common error types

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod paths;

pub use config::VolscaleConfig;
pub use error::{VolscaleError, VolscaleResult};
pub use id::{VolumeId, exact_pattern, replica_name, replica_pattern};
pub use paths::VolscalePaths;
