//! Scripted runs against an in-memory cluster.
//!
//! A scenario file declares a driver type, the logical volumes to create up
//! front and an ordered list of steps, each executed from one node:
//!
//! ```toml
//! driver = "block"
//!
//! [[volumes]]
//! name = "cache"
//! scale = 3
//!
//! [[steps]]
//! node = "n1"
//! action = "mount"
//! volume = "cache"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use volscale_common::{VolscaleConfig, VolscaleError, VolscaleResult};

use crate::client::DriverHandle;
use crate::driver::MemoryCluster;
use crate::model::{
    AttachOptions, DriverType, OPTION_SECRET, UnmountOptions, Volume, VolumeSpec,
};
use crate::service::VolumeService;

/// Node that creates the declared volumes before the first step.
const SETUP_NODE: &str = "setup";

/// A logical volume declared by a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDecl {
    /// Logical name.
    pub name: String,
    /// Volume properties; `scale` defaults to 1.
    #[serde(flatten)]
    pub spec: VolumeSpec,
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create the volume (unscaled unless `scale` is given).
    Create,
    /// Mount the volume on the step's node.
    Mount,
    /// Unmount the volume on the step's node.
    Unmount,
    /// Delete the volume.
    Remove,
    /// Resolve the volume's mount path on the step's node.
    Path,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Mount => write!(f, "mount"),
            Self::Unmount => write!(f, "unmount"),
            Self::Remove => write!(f, "remove"),
            Self::Path => write!(f, "path"),
        }
    }
}

/// Expected outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expect {
    /// The step succeeds.
    Ok,
    /// The step fails.
    Fail,
}

/// One scripted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Node issuing the request; the configured node when omitted.
    #[serde(default)]
    pub node: Option<String>,
    /// Operation.
    pub action: Action,
    /// Logical volume name.
    pub volume: String,
    /// Scale for `create` steps.
    #[serde(default)]
    pub scale: Option<u32>,
    /// Secret supplied with a `mount` request.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Expected outcome, if checked.
    #[serde(default)]
    pub expect: Option<Expect>,
}

impl Step {
    fn attach_options(&self) -> AttachOptions {
        match &self.passphrase {
            Some(secret) => AttachOptions::default().with(OPTION_SECRET, secret.clone()),
            None => AttachOptions::default(),
        }
    }
}

/// A complete scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Backend driver type.
    #[serde(default = "default_driver")]
    pub driver: DriverType,
    /// Simulated per-call backend latency in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
    /// Volumes created before the first step.
    #[serde(default)]
    pub volumes: Vec<VolumeDecl>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

const fn default_driver() -> DriverType {
    DriverType::Block
}

/// Scenario loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// I/O error.
    #[error("Failed to read scenario: {0}")]
    Io(#[from] std::io::Error),
    /// Parse error.
    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Scenario {
    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns the TOML parse error.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parse from file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }

    /// Execute every step in order.
    ///
    /// Each node mounts under its own subdirectory of the configured mount
    /// base. Steps without a node run on `config.node_id`. Step failures are
    /// recorded in the report, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a declared volume cannot be created.
    pub async fn run(&self, config: &VolscaleConfig) -> VolscaleResult<ScenarioReport> {
        let cluster = MemoryCluster::new(self.driver);
        let mut nodes = Nodes::new(&cluster, config, Duration::from_millis(self.latency_ms));

        let setup = nodes.service(SETUP_NODE);
        for decl in &self.volumes {
            setup
                .create(&setup.context(), &decl.name, decl.spec.clone(), None)
                .await?;
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let node = step.node.as_deref().unwrap_or(&config.node_id);
            let service = nodes.service(node);
            let ctx = service.context();
            let result = match step.action {
                Action::Create => {
                    let spec = VolumeSpec::scaled(step.scale.unwrap_or(1));
                    service
                        .create(&ctx, &step.volume, spec, None)
                        .await
                        .map(|id| id.to_string())
                }
                Action::Mount => service
                    .mount(&ctx, &step.volume, &step.attach_options())
                    .await
                    .map(|path| bound_replica(&cluster, &path)),
                Action::Unmount => service
                    .unmount(&ctx, &step.volume, &UnmountOptions::default())
                    .await
                    .map(|()| String::new()),
                Action::Remove => service.remove(&ctx, &step.volume).await.map(|()| String::new()),
                Action::Path => service
                    .resolve_mountpoint(&ctx, &step.volume)
                    .await
                    .map(|path| path.display().to_string()),
            };

            let report = StepReport::new(index + 1, node, step, result);
            if report.expectation_met == Some(false) {
                tracing::warn!(step = report.index, node = %node, action = %step.action, "Unexpected outcome");
            }
            steps.push(report);
        }

        Ok(ScenarioReport {
            steps,
            replicas: cluster.snapshot(),
        })
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based step number.
    pub index: usize,
    /// Node that issued the request.
    pub node: String,
    /// Operation.
    pub action: Action,
    /// Logical volume.
    pub volume: String,
    /// Whether the step succeeded.
    pub ok: bool,
    /// Replica, path or id on success; the error message on failure.
    pub detail: String,
    /// Whether the outcome matched `expect`, when one was given.
    pub expectation_met: Option<bool>,
}

impl StepReport {
    fn new(index: usize, node: &str, step: &Step, result: VolscaleResult<String>) -> Self {
        let (ok, detail) = match result {
            Ok(detail) => (true, detail),
            Err(e) => (false, e.to_string()),
        };
        Self {
            index,
            node: node.to_string(),
            action: step.action,
            volume: step.volume.clone(),
            ok,
            detail,
            expectation_met: step.expect.map(|expect| (expect == Expect::Ok) == ok),
        }
    }
}

/// Result of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// One entry per step, in order.
    pub steps: Vec<StepReport>,
    /// Every volume left in the cluster.
    pub replicas: Vec<Volume>,
}

impl ScenarioReport {
    /// Whether every step with an expectation met it.
    #[must_use]
    pub fn expectations_met(&self) -> bool {
        self.steps.iter().all(|s| s.expectation_met != Some(false))
    }
}

/// Where one node ended up in a race.
#[derive(Debug, Clone, Serialize)]
pub struct Binding {
    /// Node name.
    pub node: String,
    /// Replica bound at the node's mount path, if the mount succeeded.
    pub replica: Option<String>,
    /// Mount path or error message.
    pub detail: String,
}

/// Result of [`race`].
#[derive(Debug, Clone, Serialize)]
pub struct RaceReport {
    /// One entry per node.
    pub bindings: Vec<Binding>,
    /// Every volume left in the cluster.
    pub replicas: Vec<Volume>,
}

impl RaceReport {
    /// Replicas created for the logical volume `name`.
    #[must_use]
    pub fn replicas_of(&self, name: &str) -> Vec<&Volume> {
        let pattern = regex::Regex::new(&volscale_common::replica_pattern(name)).ok();
        self.replicas
            .iter()
            .filter(|v| pattern.as_ref().is_some_and(|re| re.is_match(v.name())))
            .collect()
    }
}

/// Create a scaled block volume and mount it from `nodes` nodes at once.
///
/// Nodes are named `node-0`, `node-1`, ...; each request runs on its own task
/// and mounts under its own subdirectory of the configured mount base.
///
/// # Errors
///
/// Returns an error if the logical volume cannot be created or a task panics.
pub async fn race(
    config: &VolscaleConfig,
    name: &str,
    scale: u32,
    nodes: usize,
    latency: Duration,
) -> VolscaleResult<RaceReport> {
    let cluster = MemoryCluster::new(DriverType::Block);
    let mut pool = Nodes::new(&cluster, config, latency);

    let setup = pool.service(SETUP_NODE);
    setup
        .create(&setup.context(), name, VolumeSpec::scaled(scale), None)
        .await?;
    tracing::info!(volume = %name, scale, nodes, "Starting mount race");

    let tasks: Vec<_> = (0..nodes)
        .map(|i| {
            let node = format!("node-{i}");
            let service = pool.service(&node);
            let name = name.to_string();
            let task = tokio::spawn(async move {
                service
                    .mount(&service.context(), &name, &AttachOptions::default())
                    .await
            });
            (node, task)
        })
        .collect();

    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    let results = futures::future::join_all(handles).await;

    let mut bindings = Vec::with_capacity(nodes);
    for (node, result) in names.into_iter().zip(results) {
        let result = result.map_err(|e| VolscaleError::Internal {
            message: format!("mount task for {node} failed: {e}"),
        })?;
        bindings.push(match result {
            Ok(path) => Binding {
                replica: Some(bound_replica(&cluster, &path)),
                detail: path.display().to_string(),
                node,
            },
            Err(e) => Binding {
                node,
                replica: None,
                detail: e.to_string(),
            },
        });
    }

    Ok(RaceReport {
        bindings,
        replicas: cluster.snapshot(),
    })
}

/// Lazily built per-node services over one cluster.
struct Nodes<'a> {
    cluster: &'a MemoryCluster,
    config: &'a VolscaleConfig,
    latency: Duration,
    services: BTreeMap<String, VolumeService>,
}

impl<'a> Nodes<'a> {
    fn new(cluster: &'a MemoryCluster, config: &'a VolscaleConfig, latency: Duration) -> Self {
        Self {
            cluster,
            config,
            latency,
            services: BTreeMap::new(),
        }
    }

    fn service(&mut self, node: &str) -> VolumeService {
        self.services
            .entry(node.to_string())
            .or_insert_with(|| {
                let driver = self.cluster.driver(node).with_latency(self.latency);
                let config = self
                    .config
                    .clone()
                    .with_node(node)
                    .with_mount_base(self.config.paths.mount_base().join(node));
                VolumeService::new(DriverHandle::ready(Arc::new(driver)), config)
            })
            .clone()
    }
}

/// Name of the volume mounted at `path`, or the path itself if none is.
fn bound_replica(cluster: &MemoryCluster, path: &Path) -> String {
    cluster
        .snapshot()
        .into_iter()
        .find(|v| v.attach_path.iter().any(|p| p == path))
        .map_or_else(|| path.display().to_string(), |v| v.locator.name)
}
