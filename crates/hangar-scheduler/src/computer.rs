//! Live nodes and the registry that holds them.

use chrono::{DateTime, Utc};
use hangar_core::{LabelExpr, NodeMode, NodeSpec};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::task::AbortHandle;

use crate::executor::Executor;

/// A regular executor slot and the handle that can kill its task.
pub(crate) struct ExecutorEntry {
    pub(crate) executor: Arc<Executor>,
    pub(crate) abort: AbortHandle,
}

/// The running counterpart of a [`NodeSpec`]: owns the node's executors.
pub struct Computer {
    name: String,
    labels: RwLock<BTreeSet<String>>,
    mode: RwLock<NodeMode>,
    num_executors: AtomicUsize,
    online: AtomicBool,
    accepting_tasks: AtomicBool,
    connected_at: DateTime<Utc>,
    executors: Mutex<BTreeMap<usize, ExecutorEntry>>,
    one_offs: Mutex<BTreeMap<usize, Arc<Executor>>>,
    next_one_off: AtomicUsize,
}

impl Computer {
    pub(crate) fn new(spec: &NodeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            labels: RwLock::new(Self::label_set(spec)),
            mode: RwLock::new(spec.mode),
            num_executors: AtomicUsize::new(spec.num_executors),
            online: AtomicBool::new(true),
            accepting_tasks: AtomicBool::new(true),
            connected_at: Utc::now(),
            executors: Mutex::new(BTreeMap::new()),
            one_offs: Mutex::new(BTreeMap::new()),
            next_one_off: AtomicUsize::new(0),
        }
    }

    // Every node carries its own name as a label.
    fn label_set(spec: &NodeSpec) -> BTreeSet<String> {
        let mut labels = spec.labels.clone();
        labels.insert(spec.name.clone());
        labels
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assigned labels plus the node's self label.
    pub fn labels(&self) -> BTreeSet<String> {
        self.labels.read().clone()
    }

    pub fn matches(&self, expr: &LabelExpr) -> bool {
        expr.matches(&self.labels.read())
    }

    pub fn mode(&self) -> NodeMode {
        *self.mode.read()
    }

    /// Configured regular executor count.
    pub fn num_executors(&self) -> usize {
        self.num_executors.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_accepting_tasks(&self) -> bool {
        self.accepting_tasks.load(Ordering::SeqCst)
    }

    /// Stop or resume handing new work to this node. Running work is
    /// unaffected.
    pub fn set_accepting_tasks(&self, accepting: bool) {
        self.accepting_tasks.store(accepting, Ordering::SeqCst);
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Executors counted toward capacity: zero while offline.
    pub fn count_executors(&self) -> usize {
        if self.is_online() {
            self.num_executors()
        } else {
            0
        }
    }

    /// Regular executors currently running a unit.
    pub fn count_busy(&self) -> usize {
        self.executors
            .lock()
            .values()
            .filter(|e| e.executor.is_busy())
            .count()
    }

    pub fn count_idle(&self) -> usize {
        self.count_executors().saturating_sub(self.count_busy())
    }

    pub fn is_idle(&self) -> bool {
        self.count_busy() == 0 && self.one_offs.lock().is_empty()
    }

    /// Regular executors in slot order.
    pub fn executors(&self) -> Vec<Arc<Executor>> {
        self.executors
            .lock()
            .values()
            .map(|e| e.executor.clone())
            .collect()
    }

    pub fn executor(&self, number: usize) -> Option<Arc<Executor>> {
        self.executors.lock().get(&number).map(|e| e.executor.clone())
    }

    pub fn one_off_executors(&self) -> Vec<Arc<Executor>> {
        self.one_offs.lock().values().cloned().collect()
    }

    /// Current shape of the node.
    pub fn spec(&self) -> NodeSpec {
        let mut labels = self.labels();
        labels.remove(&self.name);
        NodeSpec {
            name: self.name.clone(),
            num_executors: self.num_executors(),
            labels,
            mode: self.mode(),
        }
    }

    /// Kill the task behind a regular executor. The supervisor takes care of
    /// the in-flight unit and the replacement.
    pub fn kill_executor(&self, number: usize) -> bool {
        match self.executors.lock().get(&number) {
            Some(entry) => {
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn apply(&self, spec: &NodeSpec) {
        *self.labels.write() = Self::label_set(spec);
        *self.mode.write() = spec.mode;
    }

    pub(crate) fn set_num_executors(&self, n: usize) {
        self.num_executors.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub(crate) fn has_executor(&self, number: usize) -> bool {
        self.executors.lock().contains_key(&number)
    }

    pub(crate) fn insert_executor(&self, executor: Arc<Executor>, abort: AbortHandle) {
        self.executors
            .lock()
            .insert(executor.number(), ExecutorEntry { executor, abort });
    }

    /// Remove the slot only if it still holds `executor`.
    pub(crate) fn remove_executor(&self, executor: &Arc<Executor>) {
        let mut executors = self.executors.lock();
        if executors
            .get(&executor.number())
            .is_some_and(|e| Arc::ptr_eq(&e.executor, executor))
        {
            executors.remove(&executor.number());
        }
    }

    /// Abort every regular executor task.
    pub(crate) fn abort_all(&self) {
        for entry in self.executors.lock().values() {
            entry.abort.abort();
        }
    }

    /// Wake idle executors above the configured count so they retire.
    pub(crate) fn retire_surplus(&self) {
        let limit = self.num_executors();
        for entry in self.executors.lock().values() {
            if entry.executor.number() >= limit {
                entry.executor.retire();
            }
        }
    }

    pub(crate) fn next_one_off_number(&self) -> usize {
        self.next_one_off.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn add_one_off(&self, executor: Arc<Executor>) {
        self.one_offs.lock().insert(executor.number(), executor);
    }

    pub(crate) fn remove_one_off(&self, number: usize) {
        self.one_offs.lock().remove(&number);
    }
}

impl std::fmt::Debug for Computer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computer")
            .field("name", &self.name)
            .field("num_executors", &self.num_executors())
            .field("online", &self.is_online())
            .finish()
    }
}

/// Registry of live computers, keyed by node name.
pub struct Nodes {
    controller: String,
    computers: RwLock<BTreeMap<String, Arc<Computer>>>,
}

impl Nodes {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            computers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Name of the controller node, which is also its self label.
    pub fn controller_name(&self) -> &str {
        &self.controller
    }

    pub fn get(&self, name: &str) -> Option<Arc<Computer>> {
        self.computers.read().get(name).cloned()
    }

    pub fn controller(&self) -> Option<Arc<Computer>> {
        self.get(&self.controller)
    }

    /// All computers, controller first, the rest by name.
    pub fn computers(&self) -> Vec<Arc<Computer>> {
        let computers = self.computers.read();
        let controller = computers.get(&self.controller).cloned();
        controller
            .into_iter()
            .chain(
                computers
                    .iter()
                    .filter(|(name, _)| **name != self.controller)
                    .map(|(_, c)| c.clone()),
            )
            .collect()
    }

    pub fn len(&self) -> usize {
        self.computers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.computers.read().is_empty()
    }

    /// Every label atom carried by a node, self labels included.
    pub fn label_atoms(&self) -> BTreeSet<String> {
        self.computers
            .read()
            .values()
            .flat_map(|c| c.labels())
            .collect()
    }

    pub(crate) fn insert(&self, computer: Arc<Computer>) {
        self.computers
            .write()
            .insert(computer.name().to_string(), computer);
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<Computer>> {
        self.computers.write().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_label_and_spec_roundtrip() {
        let spec = NodeSpec::new("agent-1", 3).with_labels(["linux"]);
        let computer = Computer::new(&spec);
        assert!(computer.matches(&LabelExpr::parse("agent-1").unwrap()));
        assert!(computer.matches(&LabelExpr::parse("linux && agent-1").unwrap()));
        assert_eq!(computer.spec(), spec);
    }

    #[test]
    fn test_offline_computer_has_no_capacity() {
        let computer = Computer::new(&NodeSpec::new("a", 2));
        assert_eq!(computer.count_executors(), 2);
        assert_eq!(computer.count_idle(), 2);
        computer.set_online(false);
        assert_eq!(computer.count_executors(), 0);
        assert_eq!(computer.count_idle(), 0);
    }

    #[test]
    fn test_controller_listed_first() {
        let nodes = Nodes::new("main");
        nodes.insert(Arc::new(Computer::new(&NodeSpec::new("agent", 1))));
        nodes.insert(Arc::new(Computer::new(&NodeSpec::new("main", 1))));
        let names: Vec<_> = nodes
            .computers()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["main", "agent"]);
        assert!(nodes.label_atoms().contains("agent"));
    }
}
