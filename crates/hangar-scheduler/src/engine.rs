//! Wiring: builds the queue, nodes, executors and background works from a
//! [`SystemConfig`] and runs them.

use hangar_config::SystemConfig;
use hangar_core::{Cause, Error, Launcher, QueueItem, Result, Task, TimerCause};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::computer::Nodes;
use crate::executor::ExecutorPool;
use crate::janitor::RecordCleanup;
use crate::listener::{ExecutorListener, Listeners};
use crate::load::{Labels, LoadStatisticsUpdater};
use crate::periodic::{AsyncPeriodicWork, PeriodicWork, Timer, TimerHandle};
use crate::provisioner::{Cloud, NodeProvisionerInvoker};
use crate::queue::{BlockingPolicy, NeverBlock, Queue};
use crate::snapshot::{EngineSnapshot, ItemRecord, JsonFileStore, SnapshotStore};

/// Backstop re-evaluation of blocked items and flyweight placement.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(5);

/// Runs [`Queue::maintain`] and launches the flyweights it places.
pub struct QueueMaintenance {
    queue: Arc<Queue>,
    pool: Arc<ExecutorPool>,
}

impl PeriodicWork for QueueMaintenance {
    fn name(&self) -> &str {
        "queue-maintenance"
    }

    fn recurrence_period(&self) -> Duration {
        MAINTENANCE_PERIOD
    }

    fn do_run(&self) {
        for unit in self.queue.maintain() {
            self.pool.launch_one_off(unit);
        }
    }
}

/// Schedules a task on a fixed period with a [`TimerCause`].
pub struct TaskTrigger {
    queue: Arc<Queue>,
    task: Task,
    period: Duration,
    quiet_period: Duration,
}

impl TaskTrigger {
    pub fn new(queue: Arc<Queue>, task: Task, period: Duration, quiet_period: Duration) -> Self {
        Self {
            queue,
            task,
            period,
            quiet_period,
        }
    }
}

impl PeriodicWork for TaskTrigger {
    fn name(&self) -> &str {
        self.task.id.as_str()
    }

    fn recurrence_period(&self) -> Duration {
        self.period
    }

    fn do_run(&self) {
        let cause: Arc<dyn Cause> = Arc::new(TimerCause);
        if let Err(e) = self
            .queue
            .schedule(self.task.clone(), self.quiet_period, vec![cause])
        {
            warn!(task = %self.task.id, error = %e, "Timer trigger failed to schedule task");
        }
    }
}

pub struct EngineBuilder {
    config: SystemConfig,
    launcher: Arc<dyn Launcher>,
    policy: Arc<dyn BlockingPolicy>,
    clouds: Vec<Arc<dyn Cloud>>,
    store: Option<Arc<dyn SnapshotStore>>,
    listeners: Vec<Arc<dyn ExecutorListener>>,
    works: Vec<Arc<dyn PeriodicWork>>,
    async_works: Vec<Arc<dyn AsyncPeriodicWork>>,
}

impl EngineBuilder {
    pub fn new(config: SystemConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            policy: Arc::new(NeverBlock),
            clouds: Vec::new(),
            store: None,
            listeners: Vec::new(),
            works: Vec::new(),
            async_works: Vec::new(),
        }
    }

    pub fn blocking_policy(mut self, policy: Arc<dyn BlockingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn cloud(mut self, cloud: Arc<dyn Cloud>) -> Self {
        self.clouds.push(cloud);
        self
    }

    /// Overrides the file store configured by `queue snapshot=...`.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ExecutorListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn periodic_work(mut self, work: Arc<dyn PeriodicWork>) -> Self {
        self.works.push(work);
        self
    }

    pub fn async_periodic_work(mut self, work: Arc<dyn AsyncPeriodicWork>) -> Self {
        self.async_works.push(work);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let nodes = Arc::new(Nodes::new(config.controller.name.clone()));
        let queue = Arc::new(Queue::new(nodes.clone(), self.policy));
        let labels = Arc::new(Labels::new(config.load.decay, &config.controller.name));
        let listeners = Arc::new(Listeners::new());
        for listener in self.listeners {
            listeners.add(listener);
        }
        let pool = Arc::new(ExecutorPool::new(
            nodes.clone(),
            queue.clone(),
            listeners.clone(),
            self.launcher,
            config.queue.on_executor_loss,
        ));
        let provisioner = Arc::new(NodeProvisionerInvoker::new(
            nodes.clone(),
            queue.clone(),
            labels.clone(),
            pool.clone(),
            self.clouds,
            config.provisioner.clone(),
            config.load.clock,
        ));
        let store = self.store.or_else(|| {
            config
                .queue
                .snapshot
                .as_ref()
                .map(|path| Arc::new(JsonFileStore::new(path)) as Arc<dyn SnapshotStore>)
        });

        Engine {
            config,
            nodes,
            queue,
            labels,
            listeners,
            pool,
            provisioner,
            store,
            extra: Mutex::new(Some((self.works, self.async_works))),
            timer: tokio::sync::Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }
}

type ExtraWorks = (Vec<Arc<dyn PeriodicWork>>, Vec<Arc<dyn AsyncPeriodicWork>>);

/// A running scheduler.
pub struct Engine {
    config: SystemConfig,
    nodes: Arc<Nodes>,
    queue: Arc<Queue>,
    labels: Arc<Labels>,
    listeners: Arc<Listeners>,
    pool: Arc<ExecutorPool>,
    provisioner: Arc<NodeProvisionerInvoker>,
    store: Option<Arc<dyn SnapshotStore>>,
    extra: Mutex<Option<ExtraWorks>>,
    timer: tokio::sync::Mutex<Option<TimerHandle>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: SystemConfig, launcher: Arc<dyn Launcher>) -> EngineBuilder {
        EngineBuilder::new(config, launcher)
    }

    /// Restore saved state, bring up the configured nodes, and start the
    /// background works. Calling it twice is an error.
    pub async fn start(&self) -> Result<()> {
        let Some((works, async_works)) = self.extra.lock().take() else {
            return Err(Error::Internal("engine already started".to_string()));
        };

        self.restore()?;
        self.pool.sync(&self.config.all_nodes());

        let mut timer = Timer::new();
        timer
            .register(Arc::new(LoadStatisticsUpdater::new(
                self.nodes.clone(),
                self.queue.clone(),
                self.labels.clone(),
                self.config.load.clock,
            )))
            .register(Arc::new(QueueMaintenance {
                queue: self.queue.clone(),
                pool: self.pool.clone(),
            }))
            .register(self.provisioner.clone());
        if let Some(records) = &self.config.records {
            timer.register_async(Arc::new(RecordCleanup::new(&records.dir, records.period)));
        }

        for job in &self.config.jobs {
            let task = job
                .to_task()
                .map_err(|e| Error::Admission(format!("job '{}': {}", job.name, e)))?;
            let quiet = job.quiet_period.unwrap_or(self.config.queue.quiet_period);
            match job.every {
                Some(period) => {
                    timer.register(Arc::new(TaskTrigger::new(
                        self.queue.clone(),
                        task,
                        period,
                        quiet,
                    )));
                }
                None => {
                    let cause: Arc<dyn Cause> = Arc::new(TimerCause);
                    self.queue.schedule(task, quiet, vec![cause])?;
                }
            }
        }

        for work in works {
            timer.register(work);
        }
        for work in async_works {
            timer.register_async(work);
        }
        *self.timer.lock().await = Some(timer.start());

        *self.dispatcher.lock() = Some(tokio::spawn(dispatch_flyweights(
            self.queue.clone(),
            self.pool.clone(),
        )));

        info!(
            nodes = self.nodes.len(),
            pending = self.queue.len(),
            "Engine started"
        );
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(snapshot) = store.load()? else {
            return Ok(());
        };

        let mut restored = 0;
        for record in snapshot.items {
            let id = record.task.id.clone();
            match self.queue.restore(
                record.task.clone(),
                record.quiet_remaining,
                record.causes(),
                record.actions(),
            ) {
                Ok(_) => restored += 1,
                Err(e) => warn!(task = %id, error = %e, "Dropping unrestorable queue item"),
            }
        }
        if let Some(overall) = snapshot.overall {
            self.labels.restore(overall, snapshot.labels);
        }
        info!(items = restored, saved_at = %snapshot.saved_at, "Restored queue snapshot");
        Ok(())
    }

    /// Current pending items and load statistics.
    pub fn snapshot(&self) -> EngineSnapshot {
        let now = Instant::now();
        let items = self
            .queue
            .items()
            .iter()
            .map(|item| ItemRecord::from_item(item, now))
            .collect();
        EngineSnapshot::new(items, Some(self.labels.overall()), self.labels.per_label())
    }

    /// Stop background works and executors, then save the snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.shutdown().await;
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.pool.shutdown();

        if let Some(store) = &self.store {
            let snapshot = self.snapshot();
            store.save(&snapshot)?;
            info!(items = snapshot.items.len(), "Saved queue snapshot");
        }
        info!("Engine stopped");
        Ok(())
    }

    /// Schedule with the configured default quiet period.
    pub fn schedule(&self, task: Task, causes: Vec<Arc<dyn Cause>>) -> Result<QueueItem> {
        self.queue
            .schedule(task, self.config.queue.quiet_period, causes)
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutorListener>) {
        self.listeners.add(listener);
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn nodes(&self) -> &Arc<Nodes> {
        &self.nodes
    }

    pub fn labels(&self) -> &Arc<Labels> {
        &self.labels
    }

    pub fn pool(&self) -> &Arc<ExecutorPool> {
        &self.pool
    }

    pub fn provisioner(&self) -> &Arc<NodeProvisionerInvoker> {
        &self.provisioner
    }
}

/// Launch flyweights as soon as the queue places them.
async fn dispatch_flyweights(queue: Arc<Queue>, pool: Arc<ExecutorPool>) {
    loop {
        let changed = queue.changed();
        tokio::pin!(changed);
        changed.as_mut().enable();
        for unit in queue.maintain() {
            debug!(unit = %unit.id, "Launching flyweight task");
            pool.launch_one_off(unit);
        }
        match queue.next_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = &mut changed => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => changed.await,
        }
    }
}
