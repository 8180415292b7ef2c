//! Cloud capacity planning.
//!
//! A [`NodeProvisioner`] watches one label's load trends and asks clouds
//! for more nodes when the label has been saturated with a backlog for a
//! while. Both the trend and the current snapshot must agree before anything
//! is requested: the smaller queue length and the larger idle and planned
//! capacity are used, so short surges do not trigger launches.

use futures::FutureExt;
use hangar_config::ProvisionerConfig;
use hangar_core::{LabelExpr, MultiStageTimeSeries, NodeSpec, Result, TimeScale};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::computer::Nodes;
use crate::executor::ExecutorPool;
use crate::load::{LoadSample, LoadStatistics, Labels};
use crate::periodic::PeriodicWork;
use crate::queue::Queue;

const TIME_SCALE: TimeScale = TimeScale::Sec10;

/// A source of on-demand nodes.
pub trait Cloud: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this cloud can bring up nodes for `label`; `None` is the
    /// unlabeled, system-wide demand.
    fn can_provision(&self, label: Option<&LabelExpr>) -> bool;

    /// Start bringing up capacity for roughly `excess_workload` executors.
    fn provision(&self, label: Option<&LabelExpr>, excess_workload: usize) -> Vec<PlannedNode>;
}

/// A node being brought up.
pub struct PlannedNode {
    pub display_name: String,
    pub num_executors: usize,
    launch: JoinHandle<Result<NodeSpec>>,
}

impl PlannedNode {
    /// Spawn `launch` and track it. Counts as at least one executor.
    pub fn new<F>(display_name: impl Into<String>, num_executors: usize, launch: F) -> Self
    where
        F: Future<Output = Result<NodeSpec>> + Send + 'static,
    {
        Self {
            display_name: display_name.into(),
            num_executors: num_executors.max(1),
            launch: tokio::spawn(launch),
        }
    }

    pub fn is_done(&self) -> bool {
        self.launch.is_finished()
    }
}

/// Capacity planning for one label, or the whole system when `label` is
/// `None`.
pub struct NodeProvisioner {
    label: Option<LabelExpr>,
    config: ProvisionerConfig,
    pending: Vec<PlannedNode>,
    planned_capacity: MultiStageTimeSeries,
}

impl NodeProvisioner {
    pub fn new(label: Option<LabelExpr>, decay: f64, config: ProvisionerConfig) -> Self {
        Self {
            label,
            config,
            pending: Vec::new(),
            planned_capacity: MultiStageTimeSeries::new(0.0, decay),
        }
    }

    pub fn label(&self) -> Option<&LabelExpr> {
        self.label.as_ref()
    }

    /// Executors still being brought up.
    pub fn planned_capacity(&self) -> usize {
        self.pending.iter().map(|p| p.num_executors).sum()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Reap finished launches and request more capacity if needed. Returns
    /// the nodes that came up since the last call.
    pub fn update(
        &mut self,
        stats: &LoadStatistics,
        snapshot: &LoadSample,
        clouds: &[Arc<dyn Cloud>],
    ) -> Vec<NodeSpec> {
        let mut launched = Vec::new();
        let mut planned = 0.0;
        self.pending.retain_mut(|p| {
            if !p.is_done() {
                planned += p.num_executors as f64;
                return true;
            }
            match (&mut p.launch).now_or_never() {
                Some(Ok(Ok(spec))) => {
                    info!(node = %p.display_name, "Provisioning completed");
                    launched.push(spec);
                }
                Some(Ok(Err(e))) => {
                    warn!(node = %p.display_name, error = %e, "Provisioned node failed to launch")
                }
                Some(Err(e)) => {
                    warn!(node = %p.display_name, error = %e, "Provisioned node failed to launch")
                }
                None => {}
            }
            false
        });
        self.planned_capacity.update(planned);

        let idle = stats
            .latest_idle(TIME_SCALE)
            .max(snapshot.idle_executors() as f64);
        if idle >= self.config.margin {
            return launched;
        }

        let queue_length = stats
            .queue_length
            .latest(TIME_SCALE)
            .min(snapshot.queue_length as f64);
        let planned = self.planned_capacity.latest(TIME_SCALE).max(planned);
        let mut excess = queue_length - planned;
        let m = self.threshold_margin(snapshot.total_executors);
        if excess <= 1.0 - m {
            return launched;
        }

        let label = self.label_name();
        debug!(label = %label, excess, planned, queue_length, idle, margin = m, "Excess workload detected");
        for cloud in clouds.iter().filter(|c| c.can_provision(self.label.as_ref())) {
            if excess < 0.0 {
                break;
            }
            let want = (excess + m).floor() as usize;
            let nodes = cloud.provision(self.label.as_ref(), want);
            for node in &nodes {
                excess -= node.num_executors as f64;
                info!(
                    label = %label,
                    cloud = cloud.name(),
                    node = %node.display_name,
                    executors = node.num_executors,
                    remaining = excess,
                    "Started provisioning"
                );
            }
            self.pending.extend(nodes);
        }
        launched
    }

    /// Threshold margin: `margin0` with no executors, approaching `margin` as
    /// the label grows.
    fn threshold_margin(&self, total_executors: usize) -> f64 {
        let c = &self.config;
        let exp = i32::try_from(total_executors).unwrap_or(i32::MAX);
        (c.margin + (c.margin0 - c.margin) * c.margin_decay.powi(exp)).clamp(0.0, 1.0)
    }

    fn label_name(&self) -> String {
        self.label
            .as_ref()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "(system)".to_string())
    }
}

struct Provisioners {
    overall: NodeProvisioner,
    per_label: BTreeMap<String, NodeProvisioner>,
}

/// Runs every provisioner on the load clock and adds launched nodes to the
/// pool.
pub struct NodeProvisionerInvoker {
    nodes: Arc<Nodes>,
    queue: Arc<Queue>,
    labels: Arc<Labels>,
    pool: Arc<ExecutorPool>,
    clouds: Vec<Arc<dyn Cloud>>,
    config: ProvisionerConfig,
    clock: Duration,
    provisioners: Mutex<Provisioners>,
}

impl NodeProvisionerInvoker {
    pub fn new(
        nodes: Arc<Nodes>,
        queue: Arc<Queue>,
        labels: Arc<Labels>,
        pool: Arc<ExecutorPool>,
        clouds: Vec<Arc<dyn Cloud>>,
        config: ProvisionerConfig,
        clock: Duration,
    ) -> Self {
        let overall = NodeProvisioner::new(None, labels.decay(), config.clone());
        Self {
            nodes,
            queue,
            labels,
            pool,
            clouds,
            config,
            clock,
            provisioners: Mutex::new(Provisioners {
                overall,
                per_label: BTreeMap::new(),
            }),
        }
    }

    /// Planned executors across all provisioners.
    pub fn planned_capacity(&self) -> usize {
        let p = self.provisioners.lock();
        p.overall.planned_capacity()
            + p.per_label
                .values()
                .map(NodeProvisioner::planned_capacity)
                .sum::<usize>()
    }
}

impl PeriodicWork for NodeProvisionerInvoker {
    fn name(&self) -> &str {
        "node-provisioner"
    }

    fn recurrence_period(&self) -> Duration {
        self.config.recurrence.unwrap_or(self.clock)
    }

    fn initial_delay(&self) -> Duration {
        self.config.initial_delay.unwrap_or(self.clock * 10)
    }

    fn do_run(&self) {
        if self.clouds.is_empty() {
            return;
        }
        let computers = self.nodes.computers();
        let buildable = self.queue.buildable_items();

        let launched = {
            let mut p = self.provisioners.lock();
            let snapshot = self.labels.sample_overall(&computers, &buildable);
            let mut launched = p
                .overall
                .update(&self.labels.overall(), &snapshot, &self.clouds);

            for label in self.labels.all() {
                let snapshot = self.labels.sample_label(label.expr(), &computers, &buildable);
                let provisioner = p
                    .per_label
                    .entry(label.name().to_string())
                    .or_insert_with(|| {
                        NodeProvisioner::new(
                            Some(label.expr().clone()),
                            self.labels.decay(),
                            self.config.clone(),
                        )
                    });
                launched.extend(provisioner.update(&label.load(), &snapshot, &self.clouds));
            }
            launched
        };

        for spec in launched {
            self.pool.add_node(&spec);
            info!(node = %spec.name, computers = self.nodes.len(), "Provisioned node joined");
        }
    }
}
