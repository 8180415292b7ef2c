//! Load statistics per label and for the whole system.
//!
//! Every clock tick the sampler observes executor counts and queue lengths
//! and folds them into decayed time series. A tick that was missed, for
//! example because the runtime was busy, is replayed with the value observed
//! on the late tick so the series keep decaying at the configured rate.

use hangar_core::{Affinity, LabelExpr, MultiStageTimeSeries, QueueItem, TimeScale};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::computer::{Computer, Nodes};
use crate::periodic::PeriodicWork;
use crate::queue::Queue;

/// One observation of a label or of the system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSample {
    pub total_executors: usize,
    pub busy_executors: usize,
    /// Buildable items waiting for exactly this label (roaming items for the
    /// system).
    pub queue_length: usize,
    /// All Buildable items. Only meaningful for the system.
    pub total_queue_length: usize,
}

impl LoadSample {
    pub fn idle_executors(&self) -> usize {
        self.total_executors.saturating_sub(self.busy_executors)
    }
}

/// Latest values at one time scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub total_executors: f64,
    pub busy_executors: f64,
    pub idle_executors: f64,
    pub queue_length: f64,
}

/// Decayed executor and queue trends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStatistics {
    pub total_executors: MultiStageTimeSeries,
    pub busy_executors: MultiStageTimeSeries,
    pub queue_length: MultiStageTimeSeries,
    #[serde(default)]
    pub total_queue_length: Option<MultiStageTimeSeries>,
}

impl LoadStatistics {
    /// Seeded with the current executor counts and an empty queue.
    pub fn new(decay: f64, initial: &LoadSample, system: bool) -> Self {
        Self {
            total_executors: MultiStageTimeSeries::new(initial.total_executors as f64, decay),
            busy_executors: MultiStageTimeSeries::new(initial.busy_executors as f64, decay),
            queue_length: MultiStageTimeSeries::new(0.0, decay),
            total_queue_length: system.then(|| MultiStageTimeSeries::new(0.0, decay)),
        }
    }

    pub fn update(&mut self, sample: &LoadSample, ticks: u32) {
        self.total_executors
            .update_ticks(sample.total_executors as f64, ticks);
        self.busy_executors
            .update_ticks(sample.busy_executors as f64, ticks);
        self.queue_length
            .update_ticks(sample.queue_length as f64, ticks);
        if let Some(total) = &mut self.total_queue_length {
            total.update_ticks(sample.total_queue_length as f64, ticks);
        }
    }

    /// Latest idle executor trend. Can dip below zero briefly because the
    /// two series are decayed separately.
    pub fn latest_idle(&self, scale: TimeScale) -> f64 {
        self.total_executors.latest(scale) - self.busy_executors.latest(scale)
    }

    pub fn latest(&self, scale: TimeScale) -> LoadSnapshot {
        LoadSnapshot {
            total_executors: self.total_executors.latest(scale),
            busy_executors: self.busy_executors.latest(scale),
            idle_executors: self.latest_idle(scale),
            queue_length: self.queue_length.latest(scale),
        }
    }

    /// Queue length history at `scale`, newest first.
    pub fn history(&self, scale: TimeScale) -> Vec<f64> {
        self.queue_length.pick(scale).history()
    }
}

/// A label atom or expression with its own statistics.
pub struct Label {
    name: String,
    expr: LabelExpr,
    load: Mutex<LoadStatistics>,
}

impl Label {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expr(&self) -> &LabelExpr {
        &self.expr
    }

    pub fn load(&self) -> LoadStatistics {
        self.load.lock().clone()
    }

    pub(crate) fn update(&self, sample: &LoadSample, ticks: u32) {
        self.load.lock().update(sample, ticks);
    }
}

/// Registry of labels seen so far plus the system-wide statistics.
pub struct Labels {
    decay: f64,
    controller: LabelExpr,
    labels: RwLock<BTreeMap<String, Arc<Label>>>,
    overall: Mutex<LoadStatistics>,
}

impl Labels {
    pub fn new(decay: f64, controller: &str) -> Self {
        Self {
            decay,
            controller: LabelExpr::atom(controller),
            labels: RwLock::new(BTreeMap::new()),
            overall: Mutex::new(LoadStatistics::new(decay, &LoadSample::default(), true)),
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Look up a label by expression. `linux||mac` and `linux || mac` name
    /// the same label.
    pub fn get(&self, expr: &str) -> Option<Arc<Label>> {
        match LabelExpr::parse(expr) {
            Ok(parsed) => self.get_exact(&parsed.to_string()),
            Err(_) => self.get_exact(expr),
        }
    }

    fn get_exact(&self, name: &str) -> Option<Arc<Label>> {
        self.labels.read().get(name).cloned()
    }

    /// Look up a label, creating it with statistics seeded from `computers`.
    pub fn get_or_create(&self, expr: &LabelExpr, computers: &[Arc<Computer>]) -> Arc<Label> {
        let name = expr.to_string();
        if let Some(label) = self.get_exact(&name) {
            return label;
        }
        let initial = self.sample_label(expr, computers, &[]);
        self.labels
            .write()
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(Label {
                    name,
                    expr: expr.clone(),
                    load: Mutex::new(LoadStatistics::new(self.decay, &initial, false)),
                })
            })
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<Label>> {
        self.labels.read().values().cloned().collect()
    }

    /// System-wide statistics.
    pub fn overall(&self) -> LoadStatistics {
        self.overall.lock().clone()
    }

    /// Statistics for every label, keyed by label name.
    pub fn per_label(&self) -> BTreeMap<String, LoadStatistics> {
        self.labels
            .read()
            .iter()
            .map(|(name, label)| (name.clone(), label.load()))
            .collect()
    }

    /// Replace statistics with saved ones. Labels that fail to parse are
    /// skipped.
    pub fn restore(&self, overall: LoadStatistics, labels: BTreeMap<String, LoadStatistics>) {
        *self.overall.lock() = overall;
        let mut map = self.labels.write();
        for (name, load) in labels {
            let Ok(expr) = LabelExpr::parse(&name) else {
                continue;
            };
            map.insert(
                expr.to_string(),
                Arc::new(Label {
                    name: expr.to_string(),
                    expr,
                    load: Mutex::new(load),
                }),
            );
        }
    }

    /// Current observation for one label.
    pub fn sample_label(
        &self,
        expr: &LabelExpr,
        computers: &[Arc<Computer>],
        buildable: &[QueueItem],
    ) -> LoadSample {
        let mut sample = LoadSample::default();
        for computer in computers.iter().filter(|c| c.matches(expr)) {
            sample.total_executors += computer.count_executors();
            sample.busy_executors += computer.count_busy();
        }
        sample.queue_length = buildable
            .iter()
            .filter(|item| match &item.task.affinity {
                Affinity::Label(e) => e == expr,
                Affinity::Controller => *expr == self.controller,
                Affinity::Roam => false,
            })
            .count();
        sample.total_queue_length = buildable.len();
        sample
    }

    /// Current observation for the whole system.
    pub fn sample_overall(&self, computers: &[Arc<Computer>], buildable: &[QueueItem]) -> LoadSample {
        LoadSample {
            total_executors: computers.iter().map(|c| c.count_executors()).sum(),
            busy_executors: computers.iter().map(|c| c.count_busy()).sum(),
            queue_length: buildable
                .iter()
                .filter(|i| i.task.affinity == Affinity::Roam)
                .count(),
            total_queue_length: buildable.len(),
        }
    }

    /// Register node atoms and the labels of Buildable items, then fold one
    /// observation into every label and the system.
    pub fn sample(&self, nodes: &Nodes, buildable: &[QueueItem], ticks: u32) {
        let computers = nodes.computers();
        for atom in nodes.label_atoms() {
            self.get_or_create(&LabelExpr::atom(atom), &computers);
        }
        for item in buildable {
            if let Affinity::Label(expr) = &item.task.affinity {
                self.get_or_create(expr, &computers);
            }
        }

        for label in self.all() {
            let sample = self.sample_label(&label.expr, &computers, buildable);
            label.update(&sample, ticks);
        }
        let overall = self.sample_overall(&computers, buildable);
        self.overall.lock().update(&overall, ticks);
        trace!(
            total = overall.total_executors,
            busy = overall.busy_executors,
            queue = overall.total_queue_length,
            ticks,
            "Sampled load statistics"
        );
    }
}

/// Periodic sampler feeding [`Labels`].
pub struct LoadStatisticsUpdater {
    nodes: Arc<Nodes>,
    queue: Arc<Queue>,
    labels: Arc<Labels>,
    clock: Duration,
    last: Mutex<Option<Instant>>,
}

impl LoadStatisticsUpdater {
    pub fn new(nodes: Arc<Nodes>, queue: Arc<Queue>, labels: Arc<Labels>, clock: Duration) -> Self {
        Self {
            nodes,
            queue,
            labels,
            clock,
            last: Mutex::new(None),
        }
    }

    /// Clock ticks since the previous run, at least one.
    fn elapsed_ticks(&self) -> u32 {
        let now = Instant::now();
        let previous = self.last.lock().replace(now);
        match previous {
            None => 1,
            Some(previous) => {
                let ticks = now.duration_since(previous).as_secs_f64() / self.clock.as_secs_f64();
                (ticks.round() as u32).max(1)
            }
        }
    }
}

impl PeriodicWork for LoadStatisticsUpdater {
    fn name(&self) -> &str {
        "load-statistics"
    }

    fn recurrence_period(&self) -> Duration {
        self.clock
    }

    fn do_run(&self) {
        let ticks = self.elapsed_ticks();
        let buildable = self.queue.buildable_items();
        self.labels.sample(&self.nodes, &buildable, ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NeverBlock;
    use hangar_core::{NodeSpec, Task};

    fn setup(specs: &[NodeSpec]) -> (Arc<Nodes>, Arc<Queue>, Arc<Labels>) {
        let nodes = Arc::new(Nodes::new("main"));
        for spec in specs {
            nodes.insert(Arc::new(Computer::new(spec)));
        }
        let queue = Arc::new(Queue::new(nodes.clone(), Arc::new(NeverBlock)));
        (nodes, queue, Arc::new(Labels::new(0.9, "main")))
    }

    #[tokio::test]
    async fn test_samples_count_matching_nodes_and_exact_label_items() {
        let (nodes, queue, labels) = setup(&[
            NodeSpec::new("main", 2),
            NodeSpec::new("l1", 3).with_labels(["linux"]),
            NodeSpec::new("l2", 1).with_labels(["linux", "arm"]),
        ]);
        queue
            .schedule(Task::new("a").with_label("linux").unwrap(), Duration::ZERO, vec![])
            .unwrap();
        queue
            .schedule(Task::new("b").with_label("linux && arm").unwrap(), Duration::ZERO, vec![])
            .unwrap();
        queue
            .schedule(Task::new("c"), Duration::ZERO, vec![])
            .unwrap();
        queue
            .schedule(
                Task::new("d").with_affinity(Affinity::Controller),
                Duration::ZERO,
                vec![],
            )
            .unwrap();

        let computers = nodes.computers();
        let buildable = queue.buildable_items();
        assert_eq!(buildable.len(), 4);

        let linux = labels.sample_label(&LabelExpr::atom("linux"), &computers, &buildable);
        assert_eq!(linux.total_executors, 4);
        assert_eq!(linux.queue_length, 1);

        let main = labels.sample_label(&LabelExpr::atom("main"), &computers, &buildable);
        assert_eq!(main.total_executors, 2);
        assert_eq!(main.queue_length, 1);

        let overall = labels.sample_overall(&computers, &buildable);
        assert_eq!(overall.total_executors, 6);
        assert_eq!(overall.queue_length, 1);
        assert_eq!(overall.total_queue_length, 4);
    }

    #[tokio::test]
    async fn test_sampling_registers_atoms_and_expressions() {
        let (nodes, queue, labels) = setup(&[NodeSpec::new("l1", 1).with_labels(["linux"])]);
        queue
            .schedule(Task::new("a").with_label("linux || mac").unwrap(), Duration::ZERO, vec![])
            .unwrap();

        labels.sample(&nodes, &queue.buildable_items(), 1);
        assert!(labels.get("linux").is_some());
        assert!(labels.get("l1").is_some());
        let expr = labels.get("linux || mac").unwrap();
        assert!(expr.load().queue_length.latest(TimeScale::Sec10) > 0.0);
        assert!(Arc::ptr_eq(&expr, &labels.get("linux||mac").unwrap()));
        assert!(labels.get("mac").is_none());
    }

    #[tokio::test]
    async fn test_idle_statistics_decay_to_zero() {
        let (nodes, _queue, labels) = setup(&[NodeSpec::new("main", 4)]);
        labels.sample(&nodes, &[], 1);
        let before = labels.overall().latest_idle(TimeScale::Sec10);

        nodes.get("main").unwrap().set_online(false);
        let mut previous = before;
        for _ in 0..100 {
            labels.sample(&nodes, &[], 1);
            let idle = labels.overall().latest_idle(TimeScale::Sec10);
            assert!(idle < previous);
            previous = idle;
        }
        assert!(previous < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ticks_are_replayed() {
        let (nodes, queue, labels) = setup(&[NodeSpec::new("main", 1)]);
        let updater = LoadStatisticsUpdater::new(
            nodes.clone(),
            queue.clone(),
            labels.clone(),
            Duration::from_secs(10),
        );
        updater.do_run();

        tokio::time::advance(Duration::from_secs(30)).await;
        queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();
        updater.do_run();

        let history = labels.overall().queue_length.sec10.history();
        // Seed, first run, then three ticks for the 30s gap.
        assert_eq!(history.len(), 5);
        assert!(history[0] > history[1] && history[1] > history[2]);
    }

    #[test]
    fn test_restore_replaces_statistics() {
        let labels = Labels::new(0.5, "main");
        let mut saved = LoadStatistics::new(0.5, &LoadSample::default(), false);
        saved.update(
            &LoadSample {
                queue_length: 4,
                ..Default::default()
            },
            1,
        );
        let mut map = BTreeMap::new();
        map.insert("linux".to_string(), saved.clone());
        map.insert("&&".to_string(), saved.clone());
        labels.restore(LoadStatistics::new(0.5, &LoadSample::default(), true), map);

        assert_eq!(labels.get("linux").unwrap().load(), saved);
        assert_eq!(labels.all().len(), 1);
    }
}
