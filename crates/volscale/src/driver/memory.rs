//! In-memory cluster driver.
//!
//! A [`MemoryCluster`] holds the shared backend state; each [`MemoryDriver`]
//! is one node's view of it. Used by the scenario runner and by tests to
//! exercise races, remote attachment and fault paths without a real backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use volscale_common::VolumeId;

use super::{DriverError, VolumeDriver};
use crate::model::{
    AttachOptions, AttachState, DriverType, LOCATION_CONSTRAINT, LOCAL_NODE, OPTION_SECRET,
    UnmountOptions, Volume, VolumeFilter, VolumeLocator, VolumeSource, VolumeSpec,
};

/// Device directory reported for attached volumes.
const DEVICE_DIR: &str = "/dev/volscale";

/// One-shot failure injected into the next matching backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next create.
    Create,
    /// Fail the next attach.
    Attach,
    /// Fail the next detach.
    Detach,
    /// Fail the next mount.
    Mount,
    /// Fail the next unmount.
    Unmount,
}

#[derive(Debug, Clone)]
struct VolumeRecord {
    id: VolumeId,
    locator: VolumeLocator,
    spec: VolumeSpec,
    parent: Option<VolumeId>,
    attached_on: Option<String>,
    created: chrono::DateTime<chrono::Utc>,
}

impl VolumeRecord {
    fn view(&self, node: Option<&str>, state: &ClusterState) -> Volume {
        let attach_state = match (&self.attached_on, node) {
            (None, _) => AttachState::Detached,
            (Some(on), Some(node)) if on == node => AttachState::AttachedLocal,
            (Some(_), _) => AttachState::AttachedRemote,
        };
        let mut attach_path: Vec<PathBuf> = state
            .mounts
            .iter()
            .filter(|(_, id)| **id == self.id)
            .map(|((_, path), _)| path.clone())
            .collect();
        attach_path.sort();

        let mut spec = self.spec.clone();
        if state.hide_secrets {
            spec.passphrase = None;
        }
        Volume {
            id: self.id.clone(),
            locator: self.locator.clone(),
            spec,
            parent: self.parent.clone(),
            attach_state,
            attached_on: self.attached_on.clone(),
            device_path: self
                .attached_on
                .as_ref()
                .map(|_| Path::new(DEVICE_DIR).join(self.id.as_str())),
            attach_path,
            created: self.created,
        }
    }

    fn secret(&self) -> Option<&str> {
        self.spec.passphrase.as_deref().filter(|p| !p.is_empty())
    }

    fn is_local_to(&self, node: &str) -> bool {
        self.spec
            .replica_set
            .as_ref()
            .is_some_and(|rs| rs.nodes.iter().any(|n| n == node))
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    volumes: Vec<VolumeRecord>,
    mounts: HashMap<(String, PathBuf), VolumeId>,
    faults: Vec<Fault>,
    unavailable: bool,
    hide_secrets: bool,
    created_names: Vec<String>,
    unmounts: Vec<UnmountOptions>,
}

impl ClusterState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        if let Some(pos) = self.faults.iter().position(|f| *f == fault) {
            self.faults.remove(pos);
            true
        } else {
            false
        }
    }

    fn record(&self, id: &VolumeId) -> Result<&VolumeRecord, DriverError> {
        self.volumes
            .iter()
            .find(|v| v.id == *id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))
    }

    fn record_mut(&mut self, id: &VolumeId) -> Result<&mut VolumeRecord, DriverError> {
        self.volumes
            .iter_mut()
            .find(|v| v.id == *id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))
    }
}

/// Shared backend state for a set of simulated nodes.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    driver_type: DriverType,
}

impl MemoryCluster {
    /// Create an empty cluster of the given driver type.
    #[must_use]
    pub fn new(driver_type: DriverType) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::default())),
            driver_type,
        }
    }

    /// The driver as seen from `node`.
    #[must_use]
    pub fn driver(&self, node: impl Into<String>) -> MemoryDriver {
        MemoryDriver {
            cluster: self.clone(),
            node: node.into(),
            latency: None,
        }
    }

    /// Fail the next call of the given kind, on any node.
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Make every call fail as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Leave passphrases out of inspect and enumerate results, the way
    /// backends that never echo secrets behave.
    pub fn set_hide_secrets(&self, hide: bool) {
        self.state.lock().hide_secrets = hide;
    }

    /// Every volume in creation order, attach state relative to no node.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Volume> {
        let state = self.state.lock();
        state
            .volumes
            .iter()
            .map(|v| v.view(None, &state))
            .collect()
    }

    /// Names of every successful create, in order.
    #[must_use]
    pub fn created_names(&self) -> Vec<String> {
        self.state.lock().created_names.clone()
    }

    /// Options of every successful unmount, in order.
    #[must_use]
    pub fn unmount_options(&self) -> Vec<UnmountOptions> {
        self.state.lock().unmounts.clone()
    }
}

/// One node's view of a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    cluster: MemoryCluster,
    node: String,
    latency: Option<Duration>,
}

impl MemoryDriver {
    /// Delay every call by `latency` before touching state.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The node this view belongs to.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    async fn enter(&self) -> Result<parking_lot::MutexGuard<'_, ClusterState>, DriverError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let state = self.cluster.state.lock();
        if state.unavailable {
            return Err(DriverError::Unavailable("connection refused".to_string()));
        }
        Ok(state)
    }

    fn resolve_local(&self, mut spec: VolumeSpec) -> VolumeSpec {
        if let Some(rs) = spec.replica_set.as_mut() {
            for node in &mut rs.nodes {
                if node == LOCAL_NODE {
                    node.clone_from(&self.node);
                }
            }
        }
        spec
    }
}

#[async_trait]
impl VolumeDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn driver_type(&self) -> DriverType {
        self.cluster.driver_type
    }

    async fn create(
        &self,
        locator: &VolumeLocator,
        source: Option<&VolumeSource>,
        spec: &VolumeSpec,
    ) -> Result<VolumeId, DriverError> {
        let mut state = self.enter().await?;
        if state.take_fault(Fault::Create) {
            return Err(DriverError::Other(format!(
                "injected create failure for {}",
                locator.name
            )));
        }
        if state.volumes.iter().any(|v| v.locator.name == locator.name) {
            return Err(DriverError::AlreadyExists(locator.name.clone()));
        }

        let (spec, parent) = match source.and_then(|s| s.parent.as_ref()) {
            Some(parent) => (state.record(parent)?.spec.clone(), Some(parent.clone())),
            None => (spec.clone(), None),
        };
        let id = VolumeId::generate();
        state.volumes.push(VolumeRecord {
            id: id.clone(),
            locator: locator.clone(),
            spec: self.resolve_local(spec),
            parent,
            attached_on: None,
            created: chrono::Utc::now(),
        });
        state.created_names.push(locator.name.clone());

        tracing::debug!(node = %self.node, volume = %locator.name, id = %id, "Volume created");
        Ok(id)
    }

    async fn delete(&self, id: &VolumeId) -> Result<(), DriverError> {
        let mut state = self.enter().await?;
        let record = state.record(id)?;
        if record.attached_on.is_some() || state.mounts.values().any(|m| m == id) {
            return Err(DriverError::Other(format!(
                "volume {} is in use",
                record.locator.name
            )));
        }
        state.volumes.retain(|v| v.id != *id);
        Ok(())
    }

    async fn inspect(&self, id: &VolumeId) -> Result<Volume, DriverError> {
        let state = self.enter().await?;
        Ok(state.record(id)?.view(Some(&self.node), &state))
    }

    async fn enumerate(&self, filter: &VolumeFilter) -> Result<Vec<Volume>, DriverError> {
        let state = self.enter().await?;
        let pattern = filter
            .name_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| DriverError::Other(format!("invalid name filter: {e}")))?;

        Ok(state
            .volumes
            .iter()
            .filter(|v| pattern.as_ref().is_none_or(|re| re.is_match(&v.locator.name)))
            .filter(|v| !filter.wants_local() || v.is_local_to(&self.node))
            .filter(|v| {
                filter
                    .labels
                    .iter()
                    .filter(|(k, _)| k.as_str() != LOCATION_CONSTRAINT)
                    .all(|(k, val)| v.locator.labels.get(k) == Some(val))
            })
            .map(|v| v.view(Some(&self.node), &state))
            .collect())
    }

    async fn attach(
        &self,
        id: &VolumeId,
        options: &AttachOptions,
    ) -> Result<PathBuf, DriverError> {
        let mut state = self.enter().await?;
        if state.take_fault(Fault::Attach) {
            return Err(DriverError::Other(format!("injected attach failure for {id}")));
        }
        let node = self.node.clone();
        let record = state.record_mut(id)?;
        if record.secret().is_some_and(|s| options.get(OPTION_SECRET) != Some(s)) {
            return Err(DriverError::Other(format!(
                "missing or wrong secret for encrypted volume {}",
                record.locator.name
            )));
        }
        match record.attached_on.clone() {
            Some(on) if on != node => {
                return Err(DriverError::AttachedOnRemoteNode(record.locator.name.clone()));
            }
            Some(_) => {}
            None => record.attached_on = Some(node),
        }
        Ok(Path::new(DEVICE_DIR).join(id.as_str()))
    }

    async fn detach(&self, id: &VolumeId) -> Result<(), DriverError> {
        let mut state = self.enter().await?;
        if state.take_fault(Fault::Detach) {
            return Err(DriverError::Other(format!("injected detach failure for {id}")));
        }
        if state
            .mounts
            .iter()
            .any(|((n, _), m)| *n == self.node && m == id)
        {
            return Err(DriverError::Other(format!("volume {id} is still mounted")));
        }
        let node = self.node.clone();
        let record = state.record_mut(id)?;
        match record.attached_on.clone() {
            Some(on) if on != node => Err(DriverError::AttachedOnRemoteNode(
                record.locator.name.clone(),
            )),
            _ => {
                record.attached_on = None;
                Ok(())
            }
        }
    }

    async fn mount(&self, id: &VolumeId, path: &Path) -> Result<(), DriverError> {
        let mut state = self.enter().await?;
        if state.take_fault(Fault::Mount) {
            return Err(DriverError::Other(format!("injected mount failure for {id}")));
        }
        let record = state.record(id)?;
        if self.cluster.driver_type == DriverType::Block
            && record.attached_on.as_deref() != Some(self.node.as_str())
        {
            return Err(DriverError::Other(format!(
                "volume {} is not attached on {}",
                record.locator.name, self.node
            )));
        }
        let key = (self.node.clone(), path.to_path_buf());
        if let Some(current) = state.mounts.get(&key).filter(|current| *current != id) {
            return Err(DriverError::Other(format!(
                "{} is already mounted by {current}",
                path.display()
            )));
        }
        state.mounts.insert(key, id.clone());
        Ok(())
    }

    async fn unmount(
        &self,
        id: &VolumeId,
        path: &Path,
        options: &UnmountOptions,
    ) -> Result<(), DriverError> {
        {
            let mut state = self.enter().await?;
            if state.take_fault(Fault::Unmount) {
                return Err(DriverError::Other(format!("injected unmount failure for {id}")));
            }
            let key = (self.node.clone(), path.to_path_buf());
            if state.mounts.get(&key) != Some(id) {
                return Err(DriverError::NotFound(format!(
                    "{id} at {}",
                    path.display()
                )));
            }
            state.mounts.remove(&key);
            state.unmounts.push(options.clone());
        }

        if options.deletes_after_unmount() {
            // Only an empty mountpoint directory is removed.
            if let Err(e) = tokio::fs::remove_dir(path).await {
                tracing::debug!(path = %path.display(), error = %e, "Mount path left in place");
            }
        }
        Ok(())
    }

    async fn mounted_at(&self, path: &Path) -> Option<VolumeId> {
        let state = self.enter().await.ok()?;
        state
            .mounts
            .get(&(self.node.clone(), path.to_path_buf()))
            .cloned()
    }
}
