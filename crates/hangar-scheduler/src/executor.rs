//! Executors and the pool that runs them.
//!
//! Each regular executor is a tokio task that parks on the queue, runs one
//! unit at a time through the [`Launcher`], and reports to the listeners.
//! Flyweight units get a one-off executor that exits after its unit. A
//! supervisor task watches every executor; when one dies it settles the
//! in-flight unit according to the [`LossPolicy`] and refills the slot.

use chrono::{DateTime, Utc};
use hangar_core::{
    Error, ExecutorRef, ItemOutcome, Launcher, LossPolicy, NodeSpec, Result, WorkUnit,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::computer::{Computer, Nodes};
use crate::listener::Listeners;
use crate::queue::Queue;

/// What an executor is doing.
#[derive(Debug, Clone)]
pub enum ExecutorStatus {
    Idle { since: DateTime<Utc> },
    Busy { unit: WorkUnit, started: Instant },
    Dead { reason: String },
}

/// One execution slot on a computer.
pub struct Executor {
    node: String,
    number: usize,
    one_off: bool,
    status: Mutex<ExecutorStatus>,
    run: Mutex<Option<AbortHandle>>,
    retire: Notify,
}

impl Executor {
    pub(crate) fn new(node: &str, number: usize, one_off: bool) -> Self {
        Self {
            node: node.to_string(),
            number,
            one_off,
            status: Mutex::new(ExecutorStatus::Idle { since: Utc::now() }),
            run: Mutex::new(None),
            retire: Notify::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn is_one_off(&self) -> bool {
        self.one_off
    }

    pub fn executor_ref(&self) -> ExecutorRef {
        ExecutorRef {
            node: self.node.clone(),
            number: self.number,
            one_off: self.one_off,
        }
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status.lock().clone()
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.status.lock(), ExecutorStatus::Idle { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(*self.status.lock(), ExecutorStatus::Busy { .. })
    }

    pub fn is_alive(&self) -> bool {
        !matches!(*self.status.lock(), ExecutorStatus::Dead { .. })
    }

    pub fn current_work_unit(&self) -> Option<WorkUnit> {
        match &*self.status.lock() {
            ExecutorStatus::Busy { unit, .. } => Some(unit.clone()),
            _ => None,
        }
    }

    /// Time spent on the current unit.
    pub fn elapsed(&self) -> Option<Duration> {
        match &*self.status.lock() {
            ExecutorStatus::Busy { started, .. } => Some(started.elapsed()),
            _ => None,
        }
    }

    /// Percent done against the task's estimate, capped at 99. `None` when
    /// idle or when the task has no estimate.
    pub fn progress(&self) -> Option<u8> {
        let (elapsed, estimate) = self.elapsed_and_estimate()?;
        let estimate = estimate?;
        if estimate.is_zero() {
            return Some(99);
        }
        let percent = elapsed.as_millis() * 100 / estimate.as_millis().max(1);
        Some(percent.min(99) as u8)
    }

    /// Time left against the task's estimate, zero once overdue. `None`
    /// when idle or when the task has no estimate.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let (elapsed, estimate) = self.elapsed_and_estimate()?;
        Some(estimate?.saturating_sub(elapsed))
    }

    /// Running ten times longer than estimated, or over a day without an
    /// estimate.
    pub fn is_likely_stuck(&self) -> bool {
        match self.elapsed_and_estimate() {
            None => false,
            Some((elapsed, Some(estimate))) => elapsed > estimate * 10,
            Some((elapsed, None)) => elapsed > Duration::from_secs(24 * 60 * 60),
        }
    }

    fn elapsed_and_estimate(&self) -> Option<(Duration, Option<Duration>)> {
        match &*self.status.lock() {
            ExecutorStatus::Busy { unit, started } => {
                Some((started.elapsed(), unit.task().estimated_duration))
            }
            _ => None,
        }
    }

    /// Abort the current run. The unit completes with problems.
    pub fn interrupt(&self) -> bool {
        match self.run.lock().as_ref() {
            Some(run) => {
                info!(executor = %self.executor_ref(), "Interrupting executor");
                run.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_busy(&self, unit: WorkUnit) {
        *self.status.lock() = ExecutorStatus::Busy {
            unit,
            started: Instant::now(),
        };
    }

    fn set_idle(&self) {
        *self.status.lock() = ExecutorStatus::Idle { since: Utc::now() };
    }

    fn mark_dead(&self, reason: &str) {
        *self.status.lock() = ExecutorStatus::Dead {
            reason: reason.to_string(),
        };
    }

    fn set_run(&self, run: AbortHandle) {
        *self.run.lock() = Some(run);
    }

    fn clear_run(&self) {
        self.run.lock().take();
    }

    pub(crate) fn retire(&self) {
        self.retire.notify_one();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("executor", &self.executor_ref().to_string())
            .field("status", &self.status.lock())
            .finish()
    }
}

struct RunContext {
    queue: Arc<Queue>,
    listeners: Arc<Listeners>,
    launcher: Arc<dyn Launcher>,
    loss_policy: LossPolicy,
    shutting_down: AtomicBool,
}

impl RunContext {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Starts, resizes and stops executors for the computers in [`Nodes`].
pub struct ExecutorPool {
    nodes: Arc<Nodes>,
    ctx: Arc<RunContext>,
}

impl ExecutorPool {
    pub fn new(
        nodes: Arc<Nodes>,
        queue: Arc<Queue>,
        listeners: Arc<Listeners>,
        launcher: Arc<dyn Launcher>,
        loss_policy: LossPolicy,
    ) -> Self {
        Self {
            nodes,
            ctx: Arc::new(RunContext {
                queue,
                listeners,
                launcher,
                loss_policy,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn nodes(&self) -> &Arc<Nodes> {
        &self.nodes
    }

    pub fn loss_policy(&self) -> LossPolicy {
        self.ctx.loss_policy
    }

    /// Bring the inventory in line with `specs`: add new nodes, reshape
    /// existing ones, drop the rest.
    pub fn sync(&self, specs: &[NodeSpec]) {
        let wanted: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        for computer in self.nodes.computers() {
            if !wanted.contains(computer.name()) {
                self.remove_node(computer.name());
            }
        }
        for spec in specs {
            self.add_node(spec);
        }
    }

    /// Add a node, or reshape it when it already exists.
    pub fn add_node(&self, spec: &NodeSpec) -> Arc<Computer> {
        if let Some(computer) = self.nodes.get(&spec.name) {
            computer.apply(spec);
            self.resize(&computer, spec.num_executors);
            return computer;
        }

        let computer = Arc::new(Computer::new(spec));
        self.nodes.insert(computer.clone());
        info!(node = %spec.name, executors = spec.num_executors, "Node added");
        self.resize(&computer, spec.num_executors);
        computer
    }

    /// Take a node out of the inventory. Busy executors finish their unit
    /// first.
    pub fn remove_node(&self, name: &str) -> bool {
        let Some(computer) = self.nodes.remove(name) else {
            return false;
        };
        computer.set_accepting_tasks(false);
        computer.set_num_executors(0);
        computer.retire_surplus();
        info!(node = %name, "Node removed");
        self.ctx.queue.wake_all();
        true
    }

    pub fn set_num_executors(&self, name: &str, n: usize) -> Result<()> {
        let computer = self
            .nodes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("node '{}'", name)))?;
        self.resize(&computer, n);
        Ok(())
    }

    pub fn set_online(&self, name: &str, online: bool) -> Result<()> {
        let computer = self
            .nodes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("node '{}'", name)))?;
        computer.set_online(online);
        info!(node = %name, online, "Node connectivity changed");
        self.ctx.queue.wake_all();
        Ok(())
    }

    fn resize(&self, computer: &Arc<Computer>, n: usize) {
        if self.ctx.is_shutting_down() {
            return;
        }
        let previous = computer.num_executors();
        computer.set_num_executors(n);
        for number in 0..n {
            if !computer.has_executor(number) {
                spawn_regular(&self.ctx, computer, number);
            }
        }
        if n < previous {
            debug!(node = %computer.name(), from = previous, to = n, "Retiring surplus executors");
            computer.retire_surplus();
        }
        self.ctx.queue.wake_all();
    }

    /// Run a flyweight unit on a one-off executor.
    pub fn launch_one_off(&self, unit: WorkUnit) {
        let Some(computer) = self.nodes.get(&unit.executor.node) else {
            warn!(unit = %unit.id, node = %unit.executor.node, "Node for flyweight task is gone");
            settle_lost(&self.ctx, &unit, Duration::ZERO, "lost its node before launch");
            return;
        };

        let executor = Arc::new(Executor::new(computer.name(), unit.executor.number, true));
        executor.set_busy(unit.clone());
        computer.add_one_off(executor.clone());

        let task = tokio::spawn({
            let ctx = self.ctx.clone();
            let executor = executor.clone();
            async move { run_unit(&ctx, &executor, unit).await }
        });
        tokio::spawn(supervise_one_off(self.ctx.clone(), computer, executor, task));
    }

    /// Stop every executor. In-flight runs are interrupted and no loss
    /// handling takes place.
    pub fn shutdown(&self) {
        if self.ctx.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping executors");
        for computer in self.nodes.computers() {
            computer.set_accepting_tasks(false);
            for executor in computer
                .executors()
                .into_iter()
                .chain(computer.one_off_executors())
            {
                executor.interrupt();
            }
            computer.abort_all();
        }
    }
}

fn spawn_regular(ctx: &Arc<RunContext>, computer: &Arc<Computer>, number: usize) {
    let executor = Arc::new(Executor::new(computer.name(), number, false));
    let task = tokio::spawn(run_regular(ctx.clone(), computer.clone(), executor.clone()));
    computer.insert_executor(executor.clone(), task.abort_handle());
    tokio::spawn(supervise(ctx.clone(), computer.clone(), executor, task));
}

async fn run_regular(ctx: Arc<RunContext>, computer: Arc<Computer>, executor: Arc<Executor>) {
    debug!(executor = %executor.executor_ref(), "Executor started");
    loop {
        if executor.number() >= computer.num_executors() {
            break;
        }
        let unit = tokio::select! {
            unit = ctx.queue.pop(&computer, &executor) => unit,
            _ = executor.retire.notified() => continue,
        };
        run_unit(&ctx, &executor, unit).await;
    }
    debug!(executor = %executor.executor_ref(), "Executor retired");
}

async fn run_unit(ctx: &RunContext, executor: &Executor, unit: WorkUnit) {
    ctx.listeners.task_accepted(&unit);
    info!(unit = %unit.id, task = %unit.task().id, executor = %unit.executor, "Starting work unit");

    let started = Instant::now();
    let launch = tokio::spawn({
        let launcher = ctx.launcher.clone();
        let unit = unit.clone();
        async move { launcher.launch(&unit).await }
    });
    executor.set_run(launch.abort_handle());

    let outcome = match launch.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(Error::Aborted(format!(
            "{} was interrupted",
            unit.task().display_name
        ))),
        Err(e) => Err(Error::ExecutionFailed(format!("launcher panicked: {}", e))),
    };
    executor.clear_run();
    let duration = started.elapsed();

    // Claim completion first: a loss handler may already have settled it.
    let item_outcome = match &outcome {
        Ok(()) => ItemOutcome::Completed,
        Err(e) => ItemOutcome::Failed(e.to_string()),
    };
    if ctx.queue.complete(&unit.id, item_outcome) {
        match &outcome {
            Ok(()) => {
                info!(unit = %unit.id, task = %unit.task().id, duration_ms = duration.as_millis() as u64, "Work unit completed");
                ctx.listeners.task_completed(&unit, duration);
            }
            Err(e) => {
                warn!(unit = %unit.id, task = %unit.task().id, error = %e, "Work unit completed with problems");
                ctx.listeners
                    .task_completed_with_problems(&unit, duration, e);
            }
        }
    }
    executor.set_idle();
}

async fn supervise(
    ctx: Arc<RunContext>,
    computer: Arc<Computer>,
    executor: Arc<Executor>,
    task: JoinHandle<()>,
) {
    let result = task.await;
    computer.remove_executor(&executor);
    if ctx.is_shutting_down() {
        return;
    }

    if let Err(e) = result {
        let reason = if e.is_panic() { "panicked" } else { "was killed" };
        error!(executor = %executor.executor_ref(), reason, "Executor died");
        bury(&ctx, &executor, reason);
    }

    // Refill the slot unless it was retired.
    if executor.number() < computer.num_executors() && !computer.has_executor(executor.number()) {
        info!(executor = %executor.executor_ref(), "Replacing executor");
        spawn_regular(&ctx, &computer, executor.number());
    }
}

async fn supervise_one_off(
    ctx: Arc<RunContext>,
    computer: Arc<Computer>,
    executor: Arc<Executor>,
    task: JoinHandle<()>,
) {
    let result = task.await;
    computer.remove_one_off(executor.number());
    if ctx.is_shutting_down() {
        return;
    }
    if let Err(e) = result {
        let reason = if e.is_panic() { "panicked" } else { "was killed" };
        error!(executor = %executor.executor_ref(), reason, "One-off executor died");
        bury(&ctx, &executor, reason);
    }
}

fn bury(ctx: &RunContext, executor: &Executor, reason: &str) {
    let unit = executor.current_work_unit();
    let elapsed = executor.elapsed().unwrap_or_default();
    executor.interrupt();
    executor.mark_dead(reason);
    if let Some(unit) = unit {
        settle_lost(ctx, &unit, elapsed, reason);
    }
}

fn settle_lost(ctx: &RunContext, unit: &WorkUnit, elapsed: Duration, reason: &str) {
    // Either policy ends this unit; a requeued task runs again as a new unit.
    if ctx.queue.executor_lost(unit, ctx.loss_policy) {
        let problem = Error::ExecutorLost(format!("{} {}", unit.executor, reason));
        ctx.listeners
            .task_completed_with_problems(unit, elapsed, &problem);
    }
}
