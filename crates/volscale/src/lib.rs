//! # volscale
//!
//! Replica selection and mount orchestration for scaled logical volumes.
//!
//! A logical volume with `scale > 1` is served by up to `scale` physical
//! replicas, each attachable by one node at a time. volscale provides:
//! - Per-node replica selection with data-locality preference
//! - Lock-free scale-up under concurrent mounts from many nodes
//! - Mount/unmount coordination at a canonical per-volume path
//! - An in-memory cluster driver and scenario runner for exercising races

#![warn(missing_docs)]

pub mod attach;
pub mod cli;
pub mod client;
pub mod context;
pub mod driver;
pub mod model;
pub mod mount;
pub mod scenario;
pub mod selector;
pub mod service;

pub use client::{Connector, DriverHandle};
pub use context::RequestContext;
pub use driver::{DriverError, MemoryCluster, MemoryDriver, VolumeDriver};
pub use mount::MountCoordinator;
pub use selector::ReplicaSelector;
pub use service::VolumeService;
