//! Work units: a dispatched task bound to the executor running it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::item::QueueItem;
use crate::task::Task;
use crate::WorkUnitId;

/// Names the executor slot a work unit is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorRef {
    pub node: String,
    pub number: usize,
    pub one_off: bool,
}

impl fmt::Display for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.one_off {
            write!(f, "{}#one-off-{}", self.node, self.number)
        } else {
            write!(f, "{}#{}", self.node, self.number)
        }
    }
}

/// What happens to an in-flight work unit whose executor dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LossPolicy {
    /// Report the unit as completed with problems.
    #[default]
    Fail,
    /// Put the item back in the queue.
    Requeue,
}

impl std::str::FromStr for LossPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "fail" => Ok(LossPolicy::Fail),
            "requeue" => Ok(LossPolicy::Requeue),
            other => Err(crate::Error::InvalidInput(format!("loss policy '{}'", other))),
        }
    }
}

/// A task bound to the executor that runs it. Lives from dispatch until the
/// run finishes.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    /// The queue item as it was when it left the queue.
    pub item: QueueItem,
    pub executor: ExecutorRef,
    pub dispatched_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn task(&self) -> &Task {
        &self.item.task
    }

    /// Environment for the run: the item's actions plus scheduler-provided
    /// variables.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.item.env();
        env.insert("HANGAR_TASK".to_string(), self.item.task.id.to_string());
        env.insert("HANGAR_QUEUE_ID".to_string(), self.item.id.get().to_string());
        env.insert("HANGAR_WORK_UNIT".to_string(), self.id.to_string());
        env.insert("NODE_NAME".to_string(), self.executor.node.clone());
        env.insert(
            "EXECUTOR_NUMBER".to_string(),
            self.executor.number.to_string(),
        );
        env
    }
}
