//! Queue item snapshots.
//!
//! The queue owns the live items; everything outside it sees clones taken
//! under the queue lock.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::resource::Resource;
use crate::task::{Action, Affinity, CauseSet, Task};
use crate::{ItemId, WorkUnitId};

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState {
    /// Inside its quiet period.
    Waiting,
    /// Past the quiet period but held back by a blocking condition.
    Blocked { reason: String },
    /// Eligible for dispatch.
    Buildable,
    /// Out of the queue. Terminal.
    Left(LeftReason),
}

impl ItemState {
    /// Waiting, Blocked or Buildable.
    pub fn is_pending(&self) -> bool {
        !matches!(self, ItemState::Left(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Waiting => "waiting",
            ItemState::Blocked { .. } => "blocked",
            ItemState::Buildable => "buildable",
            ItemState::Left(_) => "left",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeftReason {
    Dispatched(WorkUnitId),
    Cancelled,
}

/// How a scheduled item ended. Requeued items carry on under a new item
/// and are not an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Completed)
    }
}

/// A task while it is pending dispatch.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: ItemId,
    pub task: Arc<Task>,
    pub state: ItemState,
    /// Wall-clock admission time.
    pub in_queue_since: DateTime<Utc>,
    /// End of the quiet period.
    pub deadline: Instant,
    pub causes: CauseSet,
    pub actions: Vec<Arc<dyn Action>>,
}

impl QueueItem {
    /// Environment contributed by the item's actions, later actions winning.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for action in &self.actions {
            action.build_env(&mut env);
        }
        env
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    /// Remaining quiet period as of `now`.
    pub fn quiet_remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// Explains why a pending item has not started yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CauseOfBlockage {
    InQuietPeriod { remaining: Duration },
    Blocked(String),
    WaitingForResource(Resource),
    NoMatchingNode(Affinity),
    WaitingForExecutor(Affinity),
}

impl fmt::Display for CauseOfBlockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CauseOfBlockage::InQuietPeriod { remaining } => {
                write!(f, "In the quiet period. Expires in {}s", remaining.as_secs())
            }
            CauseOfBlockage::Blocked(reason) => f.write_str(reason),
            CauseOfBlockage::WaitingForResource(resource) => {
                write!(f, "Waiting for resource {}", resource)
            }
            CauseOfBlockage::NoMatchingNode(affinity) => {
                write!(f, "There are no online nodes matching {}", affinity)
            }
            CauseOfBlockage::WaitingForExecutor(affinity) => {
                write!(f, "Waiting for next available executor on {}", affinity)
            }
        }
    }
}
