//! System configuration parsing.

use hangar_core::{LossPolicy, NodeMode, NodeSpec};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::{JobConfig, parse_job};
use crate::kdl_ext::*;
use crate::{ConfigError, ConfigResult};

/// Name the controller node gets when the config does not say.
pub const DEFAULT_CONTROLLER_NAME: &str = "built-in";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// The controller node. Its name doubles as the self label.
    pub controller: NodeSpec,
    /// Agent nodes.
    pub nodes: Vec<NodeSpec>,
    pub load: LoadConfig,
    pub queue: QueueConfig,
    pub provisioner: ProvisionerConfig,
    /// Build record janitor; disabled when absent.
    pub records: Option<RecordsConfig>,
    /// Root directory for per-task workspaces.
    pub workspace: PathBuf,
    /// Timer-triggered jobs.
    pub jobs: Vec<JobConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            controller: NodeSpec::new(DEFAULT_CONTROLLER_NAME, 2),
            nodes: Vec::new(),
            load: LoadConfig::default(),
            queue: QueueConfig::default(),
            provisioner: ProvisionerConfig::default(),
            records: None,
            workspace: PathBuf::from("workspace"),
            jobs: Vec::new(),
        }
    }
}

impl SystemConfig {
    /// Controller first, then agents in declaration order.
    pub fn all_nodes(&self) -> Vec<NodeSpec> {
        std::iter::once(self.controller.clone())
            .chain(self.nodes.iter().cloned())
            .collect()
    }
}

/// Load statistics sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Weight kept from the previous value on every tick.
    pub decay: f64,
    /// Sampling period.
    pub clock: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            decay: 0.9,
            clock: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Quiet period applied when a caller does not give one.
    pub quiet_period: Duration,
    pub on_executor_loss: LossPolicy,
    /// Where pending items are saved across restarts.
    pub snapshot: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(5),
            on_executor_loss: LossPolicy::Fail,
            snapshot: None,
        }
    }
}

/// Capacity planning thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Idle-executor level below which more capacity is considered.
    pub margin: f64,
    /// Threshold margin used when the label has no executors at all.
    pub margin0: f64,
    /// How fast the margin approaches `margin` as executors are added.
    pub margin_decay: f64,
    /// Delay before the first run; defaults to ten load clocks.
    pub initial_delay: Option<Duration>,
    /// Run period; defaults to the load clock.
    pub recurrence: Option<Duration>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            margin: 0.1,
            margin0: 0.5,
            margin_decay: 0.5,
            initial_delay: None,
            recurrence: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsConfig {
    pub dir: PathBuf,
    pub period: Duration,
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut controller_seen = false;

    for node in doc.nodes() {
        match node.name().value() {
            "controller" => {
                if controller_seen {
                    return Err(ConfigError::Duplicate("controller".to_string()));
                }
                controller_seen = true;
                let name = get_first_string_arg(node)
                    .unwrap_or_else(|| DEFAULT_CONTROLLER_NAME.to_string());
                config.controller = parse_node(node, name, 2)?;
            }
            "node" => {
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("node name".to_string()))?;
                config.nodes.push(parse_node(node, name, 1)?);
            }
            "load-statistics" => {
                if let Some(decay) = get_number_prop(node, "decay")? {
                    if !(0.0..1.0).contains(&decay) {
                        return Err(ConfigError::InvalidValue {
                            field: "load-statistics decay".to_string(),
                            message: format!("must be in [0, 1), got {}", decay),
                        });
                    }
                    config.load.decay = decay;
                }
                if let Some(clock) = get_seconds_prop(node, "clock")? {
                    if clock.is_zero() {
                        return Err(ConfigError::InvalidValue {
                            field: "load-statistics clock".to_string(),
                            message: "must be positive".to_string(),
                        });
                    }
                    config.load.clock = clock;
                }
            }
            "queue" => {
                if let Some(quiet) = get_seconds_prop(node, "quiet-period")? {
                    config.queue.quiet_period = quiet;
                }
                if let Some(policy) = get_string_prop(node, "on-executor-loss") {
                    config.queue.on_executor_loss =
                        policy.parse().map_err(|_| ConfigError::InvalidValue {
                            field: "queue on-executor-loss".to_string(),
                            message: format!("expected \"fail\" or \"requeue\", got {}", policy),
                        })?;
                }
                config.queue.snapshot = get_string_prop(node, "snapshot").map(PathBuf::from);
            }
            "provisioner" => {
                let p = &mut config.provisioner;
                if let Some(v) = get_number_prop(node, "margin")? {
                    p.margin = v;
                }
                if let Some(v) = get_number_prop(node, "margin0")? {
                    p.margin0 = v;
                }
                if let Some(v) = get_number_prop(node, "margin-decay")? {
                    p.margin_decay = v;
                }
                p.initial_delay = get_seconds_prop(node, "initial-delay")?;
                p.recurrence = get_seconds_prop(node, "recurrence")?;
                // margin0 below margin would make the threshold rise with capacity.
                p.margin0 = p.margin0.max(p.margin);
            }
            "records" => {
                let dir = get_string_prop(node, "dir")
                    .or_else(|| get_first_string_arg(node))
                    .ok_or_else(|| ConfigError::MissingField("records dir".to_string()))?;
                let period =
                    get_seconds_prop(node, "period")?.unwrap_or(Duration::from_secs(24 * 60 * 60));
                config.records = Some(RecordsConfig {
                    dir: PathBuf::from(dir),
                    period,
                });
            }
            "workspace" => {
                let dir = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workspace path".to_string()))?;
                config.workspace = PathBuf::from(dir);
            }
            "job" => {
                config.jobs.push(parse_job(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let mut names = HashSet::new();
    for node in config.all_nodes() {
        if !names.insert(node.name.clone()) {
            return Err(ConfigError::Duplicate(format!("node '{}'", node.name)));
        }
    }
    let mut jobs = HashSet::new();
    for job in &config.jobs {
        if !jobs.insert(job.name.clone()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
    }

    Ok(config)
}

fn parse_node(node: &KdlNode, name: String, default_executors: usize) -> ConfigResult<NodeSpec> {
    let executors = get_count_prop(node, "executors")?.unwrap_or(default_executors);
    let mode = match get_string_prop(node, "mode") {
        None => NodeMode::Normal,
        Some(m) => m.parse().map_err(|_| ConfigError::InvalidValue {
            field: format!("mode of node '{}'", name),
            message: format!("expected \"normal\" or \"exclusive\", got {}", m),
        })?,
    };
    let labels: Vec<String> = get_string_list_prop(node, "labels")
        .iter()
        .flat_map(|s| s.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .collect();

    Ok(NodeSpec::new(name, executors)
        .with_labels(labels)
        .with_mode(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.controller.name, DEFAULT_CONTROLLER_NAME);
        assert_eq!(config.controller.num_executors, 2);
        assert_eq!(config.load.clock, Duration::from_secs(10));
        assert!((config.load.decay - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.queue.quiet_period, Duration::from_secs(5));
        assert!(config.records.is_none());
    }

    #[test]
    fn test_parse_nodes_and_settings() {
        let kdl = r#"
            controller "main" executors=1 labels="linux"

            node "agent-1" executors=4 mode="exclusive" {
                labels "linux" "docker"
            }
            node "agent-2" labels="windows x86"

            load-statistics decay=0.5 clock=2
            queue quiet-period=0 on-executor-loss="requeue" snapshot="/tmp/queue.json"
            records dir="/tmp/records" period=60
            workspace "/tmp/ws"
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.controller.name, "main");
        assert!(config.controller.labels.contains("linux"));
        assert_eq!(config.nodes.len(), 2);

        let agent = &config.nodes[0];
        assert_eq!(agent.num_executors, 4);
        assert_eq!(agent.mode, NodeMode::Exclusive);
        assert!(agent.labels.contains("docker"));

        let windows = &config.nodes[1];
        assert_eq!(windows.num_executors, 1);
        assert!(windows.labels.contains("x86"));

        assert_eq!(config.load.clock, Duration::from_secs(2));
        assert_eq!(config.queue.quiet_period, Duration::ZERO);
        assert_eq!(config.queue.on_executor_loss, LossPolicy::Requeue);
        assert_eq!(config.queue.snapshot, Some(PathBuf::from("/tmp/queue.json")));
        assert_eq!(
            config.records.as_ref().map(|r| r.period),
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.workspace, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn test_rejects_duplicate_node_names() {
        let kdl = r#"
            node "a"
            node "a"
        "#;
        assert!(matches!(
            parse_system_config(kdl),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_rejects_bad_decay_and_mode() {
        assert!(matches!(
            parse_system_config("load-statistics decay=1.5"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_system_config(r#"node "a" mode="sometimes""#),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_margin0_never_below_margin() {
        let config = parse_system_config("provisioner margin=0.3 margin0=0.2").unwrap();
        assert!((config.provisioner.margin0 - 0.3).abs() < f64::EPSILON);
    }
}
