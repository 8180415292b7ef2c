//! The build queue.
//!
//! Items move Waiting -> (Blocked <-> Buildable) -> Left. All state sits
//! behind one lock; the lock is never held across an await. Idle executors
//! park on [`Queue::pop`] and are woken whenever queue state changes.

use chrono::Utc;
use hangar_core::{
    Action, Cause, CauseOfBlockage, CauseSet, Error, ExecutorRef, ItemId, ItemState, LeftReason,
    ItemOutcome, LossPolicy, QueueItem, ResourceController, Result, Task, TaskId, WorkUnit, WorkUnitId,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::computer::{Computer, Nodes};
use crate::executor::Executor;
use crate::matcher::LabelMatcher;

/// Holds back items that are otherwise ready to run.
///
/// Consulted with the queue lock held: implementations must not call back
/// into the queue.
pub trait BlockingPolicy: Send + Sync {
    /// A reason when the item may not start yet.
    fn why_blocked(&self, item: &QueueItem) -> Option<String>;
}

/// Policy that never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverBlock;

impl BlockingPolicy for NeverBlock {
    fn why_blocked(&self, _item: &QueueItem) -> Option<String> {
        None
    }
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    /// Pending items in admission order.
    items: BTreeMap<ItemId, QueueItem>,
    /// At most one pending item per task.
    by_task: HashMap<TaskId, ItemId>,
    running: HashMap<WorkUnitId, WorkUnit>,
    running_tasks: HashMap<TaskId, usize>,
    resources: ResourceController,
    /// Flyweight units placed on one-off executors, not yet launched.
    launches: Vec<WorkUnit>,
    completions: HashMap<ItemId, Vec<watch::Sender<Option<ItemOutcome>>>>,
}

impl QueueState {
    fn finish_running(&mut self, id: &WorkUnitId) -> Option<WorkUnit> {
        let unit = self.running.remove(id)?;
        self.resources.release(id);
        let task = &unit.item.task.id;
        if let Some(n) = self.running_tasks.get_mut(task) {
            *n -= 1;
            if *n == 0 {
                self.running_tasks.remove(task);
            }
        }
        Some(unit)
    }

    fn resolve(&mut self, item: ItemId, outcome: ItemOutcome) {
        for tx in self.completions.remove(&item).unwrap_or_default() {
            tx.send_replace(Some(outcome.clone()));
        }
    }

    fn find(&self, id: ItemId) -> Option<QueueItem> {
        self.items.get(&id).cloned().or_else(|| {
            self.running
                .values()
                .chain(self.launches.iter())
                .find(|u| u.item.id == id)
                .map(|u| u.item.clone())
        })
    }
}

/// Resolves once a scheduled item has run or been cancelled. Follows the
/// item through merges and requeues after executor loss.
pub struct Completion {
    rx: watch::Receiver<Option<ItemOutcome>>,
}

impl Completion {
    pub fn outcome(&self) -> Option<ItemOutcome> {
        self.rx.borrow().clone()
    }

    /// `None` when the queue is dropped before the item ends.
    pub async fn wait(mut self) -> Option<ItemOutcome> {
        let outcome = self.rx.wait_for(Option::is_some).await.ok()?;
        (*outcome).clone()
    }
}

pub struct Queue {
    state: Mutex<QueueState>,
    changed: Notify,
    nodes: Arc<Nodes>,
    matcher: LabelMatcher,
    policy: Arc<dyn BlockingPolicy>,
}

impl Queue {
    pub fn new(nodes: Arc<Nodes>, policy: Arc<dyn BlockingPolicy>) -> Self {
        Self {
            matcher: LabelMatcher::new(nodes.controller_name()),
            state: Mutex::new(QueueState::default()),
            changed: Notify::new(),
            nodes,
            policy,
        }
    }

    /// Admit a task. A task that already has a pending item is merged into
    /// it: causes are counted, the quiet period is left alone.
    pub fn schedule(
        &self,
        task: Task,
        quiet_period: Duration,
        causes: Vec<Arc<dyn Cause>>,
    ) -> Result<QueueItem> {
        self.schedule_with_actions(task, quiet_period, causes, Vec::new())
    }

    pub fn schedule_with_actions(
        &self,
        task: Task,
        quiet_period: Duration,
        causes: Vec<Arc<dyn Cause>>,
        actions: Vec<Arc<dyn Action>>,
    ) -> Result<QueueItem> {
        task.validate()?;
        let mut set = CauseSet::new();
        set.extend(causes);
        self.admit(Arc::new(task), quiet_period, set, actions)
    }

    /// Re-admit an item read back from a snapshot.
    pub fn restore(
        &self,
        task: Task,
        quiet_remaining: Duration,
        causes: CauseSet,
        actions: Vec<Arc<dyn Action>>,
    ) -> Result<QueueItem> {
        task.validate()?;
        self.admit(Arc::new(task), quiet_remaining, causes, actions)
    }

    fn admit(
        &self,
        task: Arc<Task>,
        quiet_period: Duration,
        causes: CauseSet,
        actions: Vec<Arc<dyn Action>>,
    ) -> Result<QueueItem> {
        let now = Instant::now();
        let item = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let id = Self::admit_locked(st, task, now + quiet_period, causes, actions);
            self.maintain_locked(st, now);
            st.find(id)
        };
        self.changed.notify_waiters();
        item.ok_or_else(|| Error::Internal("admitted item vanished".to_string()))
    }

    fn admit_locked(
        st: &mut QueueState,
        task: Arc<Task>,
        deadline: Instant,
        causes: CauseSet,
        actions: Vec<Arc<dyn Action>>,
    ) -> ItemId {
        if let Some(id) = st.by_task.get(&task.id).copied() {
            if let Some(existing) = st.items.get_mut(&id) {
                for entry in causes.iter() {
                    existing.causes.add_counted(entry.cause.clone(), entry.count);
                }
                existing.actions.extend(actions);
                debug!(item = %id, task = %task.id, "Merged into pending item");
                return id;
            }
        }

        st.next_id += 1;
        let id = ItemId::new(st.next_id);
        info!(item = %id, task = %task.id, "Task entered the queue");
        st.by_task.insert(task.id.clone(), id);
        st.items.insert(
            id,
            QueueItem {
                id,
                task,
                state: ItemState::Waiting,
                in_queue_since: Utc::now(),
                deadline,
                causes,
                actions,
            },
        );
        id
    }

    /// Remove an item that is still Waiting or Blocked. Buildable items are
    /// committed and cannot be cancelled.
    pub fn cancel(&self, id: ItemId) -> bool {
        {
            let mut st = self.state.lock();
            let cancellable = matches!(
                st.items.get(&id).map(|i| &i.state),
                Some(ItemState::Waiting | ItemState::Blocked { .. })
            );
            if !cancellable {
                return false;
            }
            if let Some(item) = st.items.remove(&id) {
                st.by_task.remove(&item.task.id);
                st.resolve(id, ItemOutcome::Cancelled);
                info!(item = %id, task = %item.task.id, "Cancelled queue item");
            }
        }
        self.changed.notify_waiters();
        true
    }

    /// Re-evaluate every pending item and place Buildable flyweights on
    /// one-off executors. Returns the flyweight units to launch.
    pub fn maintain(&self) -> Vec<WorkUnit> {
        let (changed, launches) = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let changed = self.maintain_locked(st, Instant::now());
            (changed, std::mem::take(&mut st.launches))
        };
        if changed {
            self.changed.notify_waiters();
        }
        launches
    }

    fn maintain_locked(&self, st: &mut QueueState, now: Instant) -> bool {
        let mut changed = false;

        let ids: Vec<ItemId> = st.items.keys().copied().collect();
        for id in ids {
            let Some(item) = st.items.get(&id) else {
                continue;
            };
            if item.state == ItemState::Waiting && now < item.deadline {
                continue;
            }
            let next = match self.block_reason(st, item) {
                Some(reason) => ItemState::Blocked { reason },
                None => ItemState::Buildable,
            };
            if let Some(item) = st.items.get_mut(&id) {
                if item.state != next {
                    debug!(item = %id, from = item.state.name(), to = next.name(), "Item state changed");
                    item.state = next;
                    changed = true;
                }
            }
        }

        let flyweights: Vec<ItemId> = st
            .items
            .values()
            .filter(|i| i.state == ItemState::Buildable && i.task.is_flyweight())
            .map(|i| i.id)
            .collect();
        if flyweights.is_empty() {
            return changed;
        }

        let computers = self.nodes.computers();
        for id in flyweights {
            let Some(item) = st.items.get(&id) else {
                continue;
            };
            if !st.resources.can_run(&item.task.resources) {
                continue;
            }
            let candidates = self.matcher.candidates(&computers, &item.task.affinity);
            let Some(computer) = candidates
                .iter()
                .find(|c| c.name() == self.nodes.controller_name())
                .or_else(|| candidates.first())
            else {
                continue;
            };
            let executor = ExecutorRef {
                node: computer.name().to_string(),
                number: computer.next_one_off_number(),
                one_off: true,
            };
            if let Some(unit) = Self::dispatch_locked(st, id, executor) {
                info!(unit = %unit.id, task = %unit.task().id, executor = %unit.executor, "Placed flyweight task");
                st.launches.push(unit);
                changed = true;
            }
        }
        changed
    }

    fn block_reason(&self, st: &QueueState, item: &QueueItem) -> Option<String> {
        if !item.task.concurrent && st.running_tasks.contains_key(&item.task.id) {
            return Some(format!("{} is already in progress", item.task.display_name));
        }
        self.policy.why_blocked(item)
    }

    fn dispatch_locked(st: &mut QueueState, id: ItemId, executor: ExecutorRef) -> Option<WorkUnit> {
        let mut item = st.items.remove(&id)?;
        st.by_task.remove(&item.task.id);

        let unit_id = WorkUnitId::new();
        item.state = ItemState::Left(LeftReason::Dispatched(unit_id));
        st.resources.acquire(unit_id, item.task.resources.clone());
        *st.running_tasks.entry(item.task.id.clone()).or_default() += 1;

        let unit = WorkUnit {
            id: unit_id,
            item,
            executor,
            dispatched_at: Utc::now(),
        };
        st.running.insert(unit_id, unit.clone());
        Some(unit)
    }

    /// Take the oldest Buildable item `computer` can run and bind it to
    /// `executor`. On failure, returns the next quiet-period deadline.
    fn poll(
        &self,
        computer: &Computer,
        executor: &Executor,
    ) -> std::result::Result<WorkUnit, Option<Instant>> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let changed = self.maintain_locked(st, now);

        let picked = st
            .items
            .values()
            .find(|i| {
                i.state == ItemState::Buildable
                    && !i.task.is_flyweight()
                    && self.matcher.can_take(computer, &i.task.affinity)
                    && st.resources.can_run(&i.task.resources)
            })
            .map(|i| i.id);

        let result = match picked.and_then(|id| Self::dispatch_locked(st, id, executor.executor_ref()))
        {
            Some(unit) => {
                executor.set_busy(unit.clone());
                Ok(unit)
            }
            None => Err(st
                .items
                .values()
                .filter(|i| i.state == ItemState::Waiting)
                .map(|i| i.deadline)
                .min()),
        };
        drop(guard);

        if changed {
            self.changed.notify_waiters();
        }
        if let Ok(unit) = &result {
            info!(unit = %unit.id, task = %unit.task().id, executor = %unit.executor, "Dispatched task");
        }
        result
    }

    /// Non-blocking [`Queue::pop`].
    pub fn try_pop(&self, computer: &Computer, executor: &Executor) -> Option<WorkUnit> {
        self.poll(computer, executor).ok()
    }

    /// Wait until `computer` can take an item, then bind it to `executor`.
    /// Dropping the future before it completes takes nothing.
    pub async fn pop(&self, computer: &Computer, executor: &Executor) -> WorkUnit {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll(computer, executor) {
                Ok(unit) => return unit,
                Err(Some(deadline)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    /// Record that a unit finished. Returns false when it was already
    /// completed or never ran.
    pub fn complete(&self, id: &WorkUnitId, outcome: ItemOutcome) -> bool {
        let finished = {
            let mut st = self.state.lock();
            let unit = st.finish_running(id);
            if let Some(unit) = &unit {
                st.resolve(unit.item.id, outcome);
            }
            unit
        };
        match finished {
            Some(unit) => {
                debug!(unit = %id, task = %unit.task().id, "Work unit completed");
                self.changed.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Settle a unit whose executor died. Returns false when the unit had
    /// already been completed.
    pub fn executor_lost(&self, unit: &WorkUnit, policy: LossPolicy) -> bool {
        match policy {
            LossPolicy::Fail => self.complete(
                &unit.id,
                ItemOutcome::Failed(format!("executor {} was lost", unit.executor)),
            ),
            LossPolicy::Requeue => {
                {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    if st.finish_running(&unit.id).is_none() {
                        return false;
                    }
                    let id = Self::admit_locked(
                        st,
                        unit.item.task.clone(),
                        Instant::now(),
                        unit.item.causes.clone(),
                        unit.item.actions.clone(),
                    );
                    if let Some(waiting) = st.completions.remove(&unit.item.id) {
                        st.completions.entry(id).or_default().extend(waiting);
                    }
                    warn!(unit = %unit.id, item = %id, task = %unit.task().id, "Re-queued work unit after executor loss");
                }
                self.changed.notify_waiters();
                true
            }
        }
    }

    /// Wake every parked executor so it re-checks the queue.
    pub fn wake_all(&self) {
        self.changed.notify_waiters();
    }

    /// Resolves on the next queue change. Call `enable` on the pinned
    /// future before inspecting state to avoid missing a change.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Handle on the outcome of a pending or running item. `None` once the
    /// item has ended or when it is unknown.
    pub fn completion(&self, id: ItemId) -> Option<Completion> {
        let mut st = self.state.lock();
        st.find(id)?;
        let (tx, rx) = watch::channel(None);
        st.completions.entry(id).or_default().push(tx);
        Some(Completion { rx })
    }

    /// Earliest quiet-period deadline among Waiting items.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .lock()
            .items
            .values()
            .filter(|i| i.state == ItemState::Waiting)
            .map(|i| i.deadline)
            .min()
    }

    /// Pending items in admission order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.lock().items.values().cloned().collect()
    }

    /// A pending item, or the item of a running unit.
    pub fn item(&self, id: ItemId) -> Option<QueueItem> {
        self.state.lock().find(id)
    }

    pub fn buildable_items(&self) -> Vec<QueueItem> {
        self.state
            .lock()
            .items
            .values()
            .filter(|i| i.state == ItemState::Buildable)
            .cloned()
            .collect()
    }

    /// Units dispatched and not yet completed, oldest first.
    pub fn running(&self) -> Vec<WorkUnit> {
        let mut units: Vec<WorkUnit> = self.state.lock().running.values().cloned().collect();
        units.sort_by_key(|u| u.dispatched_at);
        units
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Why a pending item has not started. `None` once it left the queue.
    pub fn why(&self, id: ItemId) -> Option<CauseOfBlockage> {
        let st = self.state.lock();
        let item = st.items.get(&id)?;
        let affinity = item.task.affinity.clone();
        match &item.state {
            ItemState::Waiting => Some(CauseOfBlockage::InQuietPeriod {
                remaining: item.quiet_remaining(Instant::now()),
            }),
            ItemState::Blocked { reason } => Some(CauseOfBlockage::Blocked(reason.clone())),
            ItemState::Buildable => {
                let computers = self.nodes.computers();
                if self.matcher.candidates(&computers, &affinity).is_empty() {
                    Some(CauseOfBlockage::NoMatchingNode(affinity))
                } else if let Some(r) = st.resources.missing_resource(&item.task.resources) {
                    Some(CauseOfBlockage::WaitingForResource(r))
                } else {
                    Some(CauseOfBlockage::WaitingForExecutor(affinity))
                }
            }
            ItemState::Left(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::{
        Affinity, NodeMode, NodeSpec, Resource, ResourceList, TimerCause, UserCause,
    };

    fn setup(specs: &[NodeSpec]) -> (Arc<Nodes>, Queue) {
        setup_with_policy(specs, Arc::new(NeverBlock))
    }

    fn setup_with_policy(
        specs: &[NodeSpec],
        policy: Arc<dyn BlockingPolicy>,
    ) -> (Arc<Nodes>, Queue) {
        let nodes = Arc::new(Nodes::new("main"));
        for spec in specs {
            nodes.insert(Arc::new(Computer::new(spec)));
        }
        let queue = Queue::new(nodes.clone(), policy);
        (nodes, queue)
    }

    fn slot(computer: &Computer, number: usize) -> Executor {
        Executor::new(computer.name(), number, false)
    }

    fn user(name: &str) -> Arc<dyn Cause> {
        Arc::new(UserCause {
            user: name.to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_schedule_merges_without_resetting_quiet_period() {
        let (_, queue) = setup(&[NodeSpec::new("main", 1)]);
        let first = queue
            .schedule(Task::new("build"), Duration::from_secs(5), vec![user("ann")])
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        let merged = queue
            .schedule(Task::new("build"), Duration::from_secs(5), vec![user("ann"), Arc::new(TimerCause)])
            .unwrap();

        assert_eq!(first.id, merged.id);
        assert_eq!(first.deadline, merged.deadline);
        assert_eq!(merged.causes.count_of("user:ann"), 2);
        assert_eq!(merged.causes.count_of("timer"), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_holds_item_until_deadline() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 1)]);
        let computer = nodes.get("main").unwrap();
        let executor = slot(&computer, 0);

        let item = queue
            .schedule(Task::new("build"), Duration::from_secs(5), vec![])
            .unwrap();
        assert!(queue.try_pop(&computer, &executor).is_none());
        assert!(matches!(
            queue.why(item.id),
            Some(CauseOfBlockage::InQuietPeriod { .. })
        ));

        tokio::time::advance(Duration::from_secs(5)).await;
        let unit = queue.try_pop(&computer, &executor).unwrap();
        assert_eq!(unit.item.id, item.id);
        assert_eq!(unit.item.state, ItemState::Left(LeftReason::Dispatched(unit.id)));
        assert!(executor.is_busy());
        assert!(queue.why(item.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_states_across_quiet_period() {
        let (_, queue) = setup(&[NodeSpec::new("main", 1)]);
        let item = queue
            .schedule(Task::new("build"), Duration::from_secs(5), vec![])
            .unwrap();
        assert_eq!(queue.next_deadline(), Some(item.deadline));

        tokio::time::advance(Duration::from_secs(3)).await;
        queue.maintain();
        assert_eq!(queue.item(item.id).unwrap().state, ItemState::Waiting);

        tokio::time::advance(Duration::from_secs(3)).await;
        queue.maintain();
        assert_eq!(queue.item(item.id).unwrap().state, ItemState::Buildable);
        assert_eq!(queue.buildable_items().len(), 1);
        assert_eq!(queue.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_conflicting_resources_never_run_together() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 2)]);
        let computer = nodes.get("main").unwrap();
        let ws = Resource::new("/ws/shared").unwrap();

        let a = Task::new("a").with_resources(ResourceList::new().write(ws.clone()));
        let b = Task::new("b").with_resources(ResourceList::new().write(ws.clone()));
        queue.schedule(a, Duration::ZERO, vec![]).unwrap();
        let b_item = queue.schedule(b, Duration::ZERO, vec![]).unwrap();

        let first = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();
        assert_eq!(first.task().id.as_str(), "a");
        assert!(queue.try_pop(&computer, &slot(&computer, 1)).is_none());
        assert_eq!(
            queue.why(b_item.id),
            Some(CauseOfBlockage::WaitingForResource(ws))
        );

        assert!(queue.complete(&first.id, ItemOutcome::Completed));
        assert!(!queue.complete(&first.id, ItemOutcome::Completed));
        let second = queue.try_pop(&computer, &slot(&computer, 1)).unwrap();
        assert_eq!(second.task().id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_readers_share_a_resource() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 2)]);
        let computer = nodes.get("main").unwrap();
        let cache = Resource::new("/cache").unwrap();
        for name in ["a", "b"] {
            let task = Task::new(name).with_resources(ResourceList::new().read(cache.clone()));
            queue.schedule(task, Duration::ZERO, vec![]).unwrap();
        }
        assert!(queue.try_pop(&computer, &slot(&computer, 0)).is_some());
        assert!(queue.try_pop(&computer, &slot(&computer, 1)).is_some());
    }

    #[tokio::test]
    async fn test_label_is_respected() {
        let (nodes, queue) = setup(&[
            NodeSpec::new("main", 1),
            NodeSpec::new("win", 1).with_labels(["windows"]),
        ]);
        let main = nodes.get("main").unwrap();
        let win = nodes.get("win").unwrap();

        let task = Task::new("msbuild").with_label("windows").unwrap();
        let item = queue.schedule(task, Duration::ZERO, vec![]).unwrap();
        assert!(queue.try_pop(&main, &slot(&main, 0)).is_none());

        let unit = queue.try_pop(&win, &slot(&win, 0)).unwrap();
        assert_eq!(unit.item.id, item.id);
        assert_eq!(unit.executor.node, "win");
    }

    #[tokio::test]
    async fn test_unmatched_label_reports_no_matching_node() {
        let (_, queue) = setup(&[NodeSpec::new("main", 1)]);
        let task = Task::new("t").with_label("solaris").unwrap();
        let item = queue.schedule(task, Duration::ZERO, vec![]).unwrap();
        assert!(matches!(
            queue.why(item.id),
            Some(CauseOfBlockage::NoMatchingNode(Affinity::Label(_)))
        ));
    }

    #[tokio::test]
    async fn test_exclusive_node_skips_roaming_tasks() {
        let (nodes, queue) = setup(&[NodeSpec::new("gpu", 1)
            .with_labels(["cuda"])
            .with_mode(NodeMode::Exclusive)]);
        let gpu = nodes.get("gpu").unwrap();

        queue.schedule(Task::new("roam"), Duration::ZERO, vec![]).unwrap();
        assert!(queue.try_pop(&gpu, &slot(&gpu, 0)).is_none());

        let task = Task::new("train").with_label("cuda").unwrap();
        queue.schedule(task, Duration::ZERO, vec![]).unwrap();
        let unit = queue.try_pop(&gpu, &slot(&gpu, 0)).unwrap();
        assert_eq!(unit.task().id.as_str(), "train");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_before_buildable() {
        let (_, queue) = setup(&[NodeSpec::new("main", 1)]);
        let waiting = queue
            .schedule(Task::new("a"), Duration::from_secs(60), vec![])
            .unwrap();
        let buildable = queue
            .schedule(Task::new("b"), Duration::ZERO, vec![])
            .unwrap();

        assert!(queue.cancel(waiting.id));
        assert!(!queue.cancel(waiting.id));
        assert!(!queue.cancel(buildable.id));
        assert!(!queue.cancel(ItemId::new(999)));
        assert_eq!(queue.len(), 1);

        // A cancelled task can be scheduled afresh.
        let again = queue
            .schedule(Task::new("a"), Duration::from_secs(60), vec![])
            .unwrap();
        assert_ne!(again.id, waiting.id);
    }

    #[tokio::test]
    async fn test_cancel_after_dispatch_leaves_unit_running() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 1)]);
        let computer = nodes.get("main").unwrap();
        let item = queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();
        let unit = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();

        assert!(!queue.cancel(item.id));
        let running = queue.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, unit.id);
        assert!(queue.complete(&unit.id, ItemOutcome::Completed));
        assert!(queue.running().is_empty());
    }

    #[tokio::test]
    async fn test_completion_resolves_with_outcome() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 1)]);
        let computer = nodes.get("main").unwrap();
        let built = queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();
        let dropped = queue
            .schedule(Task::new("b"), Duration::from_secs(60), vec![])
            .unwrap();
        let built_done = queue.completion(built.id).unwrap();
        let dropped_done = queue.completion(dropped.id).unwrap();
        assert!(queue.completion(ItemId::new(999)).is_none());

        let unit = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();
        // Still reachable while running.
        let late = queue.completion(built.id).unwrap();
        assert_eq!(built_done.outcome(), None);

        queue.complete(&unit.id, ItemOutcome::Completed);
        assert!(queue.cancel(dropped.id));
        assert_eq!(built_done.wait().await, Some(ItemOutcome::Completed));
        assert_eq!(late.wait().await, Some(ItemOutcome::Completed));
        assert_eq!(dropped_done.wait().await, Some(ItemOutcome::Cancelled));
        assert!(queue.completion(built.id).is_none());
    }

    #[tokio::test]
    async fn test_completion_follows_requeue_into_merged_item() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 1)]);
        let computer = nodes.get("main").unwrap();
        let first = queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();
        let first_done = queue.completion(first.id).unwrap();
        let unit = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();

        // A second request for the same task waits behind the running one.
        let second = queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();
        let second_done = queue.completion(second.id).unwrap();

        assert!(queue.executor_lost(&unit, LossPolicy::Requeue));
        assert_eq!(first_done.outcome(), None);
        assert_eq!(queue.len(), 1);

        let rerun = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();
        assert_eq!(rerun.item.id, second.id);
        assert!(queue.executor_lost(&rerun, LossPolicy::Fail));
        for done in [first_done, second_done] {
            match done.wait().await {
                Some(ItemOutcome::Failed(message)) => assert!(message.contains("main#0")),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_pop_dispatches_at_quiet_period_deadline() {
        let nodes = Arc::new(Nodes::new("main"));
        nodes.insert(Arc::new(Computer::new(&NodeSpec::new("main", 1))));
        let queue = Arc::new(Queue::new(nodes.clone(), Arc::new(NeverBlock)));
        let item = queue
            .schedule(Task::new("a"), Duration::from_secs(5), vec![])
            .unwrap();

        let waiter = {
            let queue = queue.clone();
            let computer = nodes.get("main").unwrap();
            tokio::spawn(async move {
                let executor = Executor::new("main", 0, false);
                queue.pop(&computer, &executor).await
            })
        };
        tokio::task::yield_now().await;

        // Nothing else touches the queue; only the deadline can wake the pop.
        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tokio::time::advance(Duration::from_secs(1)).await;
        let unit = waiter.await.unwrap();
        assert_eq!(unit.item.id, item.id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_non_concurrent_task_blocks_while_running() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 2)]);
        let computer = nodes.get("main").unwrap();

        queue.schedule(Task::new("deploy"), Duration::ZERO, vec![]).unwrap();
        let running = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();

        let next = queue
            .schedule(Task::new("deploy"), Duration::ZERO, vec![])
            .unwrap();
        assert_ne!(next.id, running.item.id);
        assert!(matches!(next.state, ItemState::Blocked { .. }));
        assert!(queue.try_pop(&computer, &slot(&computer, 1)).is_none());

        queue.complete(&running.id, ItemOutcome::Completed);
        assert!(queue.try_pop(&computer, &slot(&computer, 1)).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_task_runs_alongside_itself() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 2)]);
        let computer = nodes.get("main").unwrap();
        let task = Task::new("lint").concurrent(true);

        queue.schedule(task.clone(), Duration::ZERO, vec![]).unwrap();
        assert!(queue.try_pop(&computer, &slot(&computer, 0)).is_some());
        queue.schedule(task, Duration::ZERO, vec![]).unwrap();
        assert!(queue.try_pop(&computer, &slot(&computer, 1)).is_some());
    }

    struct BlockEverything;

    impl BlockingPolicy for BlockEverything {
        fn why_blocked(&self, _item: &QueueItem) -> Option<String> {
            Some("maintenance window".to_string())
        }
    }

    #[tokio::test]
    async fn test_blocking_policy_holds_items() {
        let (nodes, queue) = setup_with_policy(&[NodeSpec::new("main", 1)], Arc::new(BlockEverything));
        let computer = nodes.get("main").unwrap();
        let item = queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();

        assert!(queue.try_pop(&computer, &slot(&computer, 0)).is_none());
        assert_eq!(
            queue.why(item.id),
            Some(CauseOfBlockage::Blocked("maintenance window".to_string()))
        );
        assert!(queue.cancel(item.id));
    }

    #[tokio::test]
    async fn test_flyweight_goes_to_a_one_off_executor() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 1), NodeSpec::new("agent", 1)]);
        let main = nodes.get("main").unwrap();

        let item = queue
            .schedule(Task::new("fan-out").flyweight(), Duration::ZERO, vec![])
            .unwrap();
        assert!(matches!(item.state, ItemState::Left(_)));

        let launches = queue.maintain();
        assert_eq!(launches.len(), 1);
        assert!(launches[0].executor.one_off);
        assert_eq!(launches[0].executor.node, "main");
        assert!(queue.maintain().is_empty());

        // The regular slot is still free.
        queue.schedule(Task::new("build"), Duration::ZERO, vec![]).unwrap();
        assert!(queue.try_pop(&main, &slot(&main, 0)).is_some());
    }

    #[tokio::test]
    async fn test_executor_loss_policies() {
        let (nodes, queue) = setup(&[NodeSpec::new("main", 1)]);
        let computer = nodes.get("main").unwrap();

        queue
            .schedule(Task::new("a"), Duration::ZERO, vec![user("ann")])
            .unwrap();
        let unit = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();
        assert!(queue.executor_lost(&unit, LossPolicy::Requeue));
        assert!(!queue.executor_lost(&unit, LossPolicy::Requeue));

        let items = queue.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].causes.count_of("user:ann"), 1);

        let unit = queue.try_pop(&computer, &slot(&computer, 0)).unwrap();
        assert!(queue.executor_lost(&unit, LossPolicy::Fail));
        assert!(queue.is_empty());
        assert!(queue.running().is_empty());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_schedule() {
        let nodes = Arc::new(Nodes::new("main"));
        nodes.insert(Arc::new(Computer::new(&NodeSpec::new("main", 1))));
        let queue = Arc::new(Queue::new(nodes.clone(), Arc::new(NeverBlock)));

        let waiter = {
            let queue = queue.clone();
            let computer = nodes.get("main").unwrap();
            tokio::spawn(async move {
                let executor = Executor::new("main", 0, false);
                queue.pop(&computer, &executor).await
            })
        };
        tokio::task::yield_now().await;

        queue.schedule(Task::new("a"), Duration::ZERO, vec![]).unwrap();
        let unit = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unit.task().id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_blank_task_id_is_rejected() {
        let (_, queue) = setup(&[]);
        assert!(matches!(
            queue.schedule(Task::new("  "), Duration::ZERO, vec![]),
            Err(Error::Admission(_))
        ));
        assert!(queue.is_empty());
    }
}
