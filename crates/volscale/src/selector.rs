//! Replica selection for scaled volumes.
//!
//! A logical volume with `scale > 1` is realised by up to `scale` replicas
//! named `{base}_000`, `{base}_001`, ... The selector picks the one replica
//! to attach on the calling node, in this order of preference:
//!
//! 1. a replica whose data is local to this node,
//! 2. any existing replica,
//! 3. a new replica pinned to this node, if the scale allows,
//! 4. new unpinned replicas at increasing indices until one attaches or the
//!    scale is used up.
//!
//! Concurrent requesters on different nodes race on replica names. A create
//! that fails with `AlreadyExists` means a peer won that name; the selector
//! counts the peer's replica and moves to the next index. No lock is taken
//! and nothing a peer created is ever deleted.

use std::collections::HashSet;

use volscale_common::{VolscaleError, VolscaleResult, replica_name, replica_pattern};

use crate::attach::{AttachOutcome, attach};
use crate::context::RequestContext;
use crate::driver::{DriverError, VolumeDriver};
use crate::model::{AttachOptions, Volume, VolumeFilter, VolumeLocator, VolumeSpec};

/// Picks or creates the replica to attach for one request.
pub struct ReplicaSelector<'a> {
    ctx: &'a RequestContext,
    driver: &'a dyn VolumeDriver,
}

impl<'a> ReplicaSelector<'a> {
    /// Selector issuing backend calls through `driver` under `ctx`.
    #[must_use]
    pub const fn new(ctx: &'a RequestContext, driver: &'a dyn VolumeDriver) -> Self {
        Self { ctx, driver }
    }

    /// Attach the logical volume, or one of its replicas when it is scaled.
    ///
    /// An unscaled volume is its own only candidate and nothing is
    /// enumerated. The returned volume is the one actually attached.
    ///
    /// # Errors
    ///
    /// For unscaled volumes, the attach failure itself. For scaled volumes,
    /// `AttachExhausted` when no replica could be attached or created, or any
    /// enumeration, inspect or non-benign create error.
    pub async fn select_for_attach(
        &self,
        logical: Volume,
        options: &AttachOptions,
    ) -> VolscaleResult<Volume> {
        if !logical.is_scaled() {
            return attach(self.ctx, self.driver, logical, options)
                .await?
                .into_result();
        }
        self.attach_scaled(&logical, options).await
    }

    async fn attach_scaled(&self, logical: &Volume, options: &AttachOptions) -> VolscaleResult<Volume> {
        let base = logical.name();
        let scale = logical.spec.effective_scale() as usize;
        let replicas = VolumeFilter::name_matching(replica_pattern(base));

        let local = self
            .ctx
            .call(self.driver.enumerate(&replicas.clone().local_only()))
            .await?;
        tracing::debug!(volume = %base, candidates = local.len(), "Trying local replicas");
        if let Some(volume) = self.first_attachable(local, options).await? {
            return Ok(volume);
        }

        let existing = self.ctx.call(self.driver.enumerate(&replicas)).await?;
        let mut known: HashSet<String> = existing.iter().map(|v| v.name().to_string()).collect();
        let mut live = existing.len();
        tracing::debug!(volume = %base, candidates = live, scale, "Trying existing replicas");
        if let Some(volume) = self.first_attachable(existing, options).await? {
            return Ok(volume);
        }

        if live < scale {
            let name = replica_name(base, live);
            match self.create(&name, &logical.spec.for_local_replica()).await? {
                Ok(volume) => {
                    known.insert(name);
                    match attach(self.ctx, self.driver, volume, options).await? {
                        AttachOutcome::Attached { volume, .. } => return Ok(volume),
                        _ => live += 1,
                    }
                }
                Err(e) => {
                    tracing::debug!(volume = %base, replica = %name, error = %e, "Local replica not created, scaling up");
                }
            }
        }

        self.scale_up(logical, live, &known, options).await
    }

    /// Create unpinned replicas from index `live` until one attaches.
    ///
    /// `live` counts replicas known to exist. Every iteration either adds a
    /// replica to `live` or skips a name already in `known`, so the loop runs
    /// at most `scale + known.len()` times.
    async fn scale_up(
        &self,
        logical: &Volume,
        mut live: usize,
        known: &HashSet<String>,
        options: &AttachOptions,
    ) -> VolscaleResult<Volume> {
        let base = logical.name();
        let scale = logical.spec.effective_scale();
        let spec = logical.spec.for_scale_up();

        let mut index = live;
        while live < scale as usize {
            let name = replica_name(base, index);
            index += 1;

            match self.create(&name, &spec).await? {
                Ok(volume) => match attach(self.ctx, self.driver, volume, options).await? {
                    AttachOutcome::Attached { volume, .. } => return Ok(volume),
                    _ => live += 1,
                },
                Err(DriverError::AlreadyExists(_)) => {
                    // Concurrent create, or a replica past a hole left by a delete.
                    if !known.contains(&name) {
                        live += 1;
                    }
                    tracing::debug!(volume = %base, replica = %name, "Replica name taken, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(volume = %base, scale, "No attachable replica within scale");
        Err(VolscaleError::AttachExhausted {
            name: base.to_string(),
            scale,
        })
    }

    /// Try candidates in order; the first that attaches wins.
    async fn first_attachable(
        &self,
        candidates: Vec<Volume>,
        options: &AttachOptions,
    ) -> VolscaleResult<Option<Volume>> {
        for candidate in candidates {
            if let AttachOutcome::Attached { volume, .. } =
                attach(self.ctx, self.driver, candidate, options).await?
            {
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }

    /// Create and inspect one replica.
    ///
    /// The outer result carries cancellation and inspect failures; the inner
    /// one the create outcome for the caller to classify.
    async fn create(
        &self,
        name: &str,
        spec: &VolumeSpec,
    ) -> VolscaleResult<Result<Volume, DriverError>> {
        let created = self
            .ctx
            .guard(self.driver.create(&VolumeLocator::named(name), None, spec))
            .await?;
        match created {
            Ok(id) => {
                tracing::info!(replica = %name, id = %id, "Created replica");
                let volume = self.ctx.call(self.driver.inspect(&id)).await?;
                Ok(Ok(volume))
            }
            Err(e) => Ok(Err(e)),
        }
    }
}
