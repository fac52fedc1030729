//! volscale CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, bail};
use tabled::{Table, Tabled};

use volscale_common::VolscaleConfig;
use volscale_common::config::DEFAULT_NODE;

use crate::model::Volume;
use crate::scenario::{RaceReport, Scenario, ScenarioReport, race};

/// volscale - Scale-out replica selection and mount orchestration
#[derive(Parser)]
#[command(name = "volscale")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Base directory for volume mountpoints
    #[arg(
        long,
        global = true,
        env = "VOLSCALE_MOUNT_BASE",
        default_value = "/var/lib/volscale/mounts"
    )]
    pub mount_base: PathBuf,

    /// Name of the node issuing requests
    #[arg(long, global = true, env = "VOLSCALE_NODE", default_value = DEFAULT_NODE)]
    pub node: String,

    /// Per-request deadline in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// volscale commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario file against an in-memory cluster
    Run {
        /// Path to the scenario TOML file
        scenario: PathBuf,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Mount one scaled volume from many nodes at once
    Race {
        /// Logical volume name
        name: String,

        /// Replica count
        #[arg(short, long, default_value = "3")]
        scale: u32,

        /// Number of concurrently mounting nodes
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Simulated backend latency per call in milliseconds
        #[arg(long, default_value = "5")]
        latency_ms: u64,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "STEP")]
    step: usize,
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "ACTION")]
    action: String,
    #[tabled(rename = "VOLUME")]
    volume: String,
    #[tabled(rename = "RESULT")]
    result: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

#[derive(Tabled)]
struct ReplicaRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "SCALE")]
    scale: u32,
    #[tabled(rename = "PINNED")]
    pinned: String,
    #[tabled(rename = "ATTACHED ON")]
    attached_on: String,
    #[tabled(rename = "MOUNTED AT")]
    mounted_at: String,
}

impl From<&Volume> for ReplicaRow {
    fn from(v: &Volume) -> Self {
        Self {
            name: v.name().to_string(),
            scale: v.spec.scale,
            pinned: v
                .spec
                .replica_set
                .as_ref()
                .map_or_else(|| "-".to_string(), |rs| rs.nodes.join(",")),
            attached_on: v.attached_on.clone().unwrap_or_else(|| "-".to_string()),
            mounted_at: if v.attach_path.is_empty() {
                "-".to_string()
            } else {
                v.attach_path
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            },
        }
    }
}

#[derive(Tabled)]
struct BindingRow {
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "REPLICA")]
    replica: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

impl Cli {
    /// Log filter directive for the selected verbosity.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        if self.debug {
            "volscale=debug"
        } else {
            "volscale=info"
        }
    }

    /// Runtime configuration from the global flags.
    #[must_use]
    pub fn config(&self) -> VolscaleConfig {
        let config = VolscaleConfig::default()
            .with_node(self.node.clone())
            .with_mount_base(self.mount_base.clone());
        match self.timeout_ms {
            Some(ms) => config.with_request_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails, or if a scenario step did not
    /// meet its expectation.
    pub async fn execute(self) -> Result<()> {
        let config = self.config();
        match self.command {
            Commands::Run { scenario, format } => {
                let spec = Scenario::from_file(&scenario)?;
                tracing::info!(
                    scenario = %scenario.display(),
                    steps = spec.steps.len(),
                    "Running scenario"
                );
                let report = spec.run(&config).await?;

                if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_scenario(&report);
                }

                if !report.expectations_met() {
                    bail!("scenario expectations not met");
                }
                Ok(())
            }

            Commands::Race {
                name,
                scale,
                nodes,
                latency_ms,
                format,
            } => {
                let report =
                    race(&config, &name, scale, nodes, Duration::from_millis(latency_ms)).await?;

                if format == "json" {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_race(&report);
                }
                Ok(())
            }
        }
    }
}

fn print_scenario(report: &ScenarioReport) {
    let rows: Vec<StepRow> = report
        .steps
        .iter()
        .map(|s| StepRow {
            step: s.index,
            node: s.node.clone(),
            action: s.action.to_string(),
            volume: s.volume.clone(),
            result: match (s.ok, s.expectation_met) {
                (_, Some(false)) => "UNEXPECTED".to_string(),
                (true, _) => "ok".to_string(),
                (false, _) => "error".to_string(),
            },
            detail: s.detail.clone(),
        })
        .collect();
    println!("{}", Table::new(rows));
    println!();
    print_replicas(&report.replicas);
}

fn print_race(report: &RaceReport) {
    let rows: Vec<BindingRow> = report
        .bindings
        .iter()
        .map(|b| BindingRow {
            node: b.node.clone(),
            replica: b.replica.clone().unwrap_or_else(|| "-".to_string()),
            detail: b.detail.clone(),
        })
        .collect();
    println!("{}", Table::new(rows));
    println!();
    print_replicas(&report.replicas);
}

fn print_replicas(volumes: &[Volume]) {
    if volumes.is_empty() {
        println!("No volumes");
        return;
    }
    let rows: Vec<ReplicaRow> = volumes.iter().map(ReplicaRow::from).collect();
    println!("{}", Table::new(rows));
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_race() {
        let cli = Cli::try_parse_from([
            "volscale",
            "--mount-base",
            "/tmp/m",
            "race",
            "cache",
            "--scale",
            "4",
            "--nodes",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.mount_base, PathBuf::from("/tmp/m"));
        assert_eq!(cli.log_directive(), "volscale=info");
        assert_eq!(cli.config().paths.mount_base(), std::path::Path::new("/tmp/m"));
        assert!(cli.config().request_timeout.is_none());
        match cli.command {
            Commands::Race {
                name, scale, nodes, ..
            } => {
                assert_eq!(name, "cache");
                assert_eq!(scale, 4);
                assert_eq!(nodes, 2);
            }
            Commands::Run { .. } => panic!("expected race"),
        }
    }

    #[test]
    fn debug_flag_raises_verbosity() {
        let cli = Cli::try_parse_from([
            "volscale",
            "run",
            "s.toml",
            "--debug",
            "--node",
            "n7",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(cli.log_directive(), "volscale=debug");
        let config = cli.config();
        assert_eq!(config.node_id, "n7");
        assert_eq!(config.request_timeout, Some(Duration::from_millis(250)));
    }
}
