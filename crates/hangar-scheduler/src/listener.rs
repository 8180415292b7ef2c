//! Executor listeners.
//!
//! Every work unit publishes exactly one acceptance and exactly one
//! completion event. Delivery order across listeners is unspecified; a
//! panicking listener is logged and does not stop delivery to the others.

use hangar_core::{Error, WorkUnit};
use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

/// Receives executor lifecycle callbacks. All methods default to no-ops.
pub trait ExecutorListener: Send + Sync {
    /// The executor took the unit and is about to run it.
    fn task_accepted(&self, _unit: &WorkUnit) {}

    /// The unit ran to completion without problems.
    fn task_completed(&self, _unit: &WorkUnit, _duration: Duration) {}

    /// The unit failed, was aborted, or lost its executor.
    fn task_completed_with_problems(&self, _unit: &WorkUnit, _elapsed: Duration, _err: &Error) {}
}

/// Registered listeners.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Arc<dyn ExecutorListener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ExecutorListener>) {
        self.inner.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub(crate) fn task_accepted(&self, unit: &WorkUnit) {
        self.each("task_accepted", |l| l.task_accepted(unit));
    }

    pub(crate) fn task_completed(&self, unit: &WorkUnit, duration: Duration) {
        self.each("task_completed", |l| l.task_completed(unit, duration));
    }

    pub(crate) fn task_completed_with_problems(
        &self,
        unit: &WorkUnit,
        duration: Duration,
        problem: &Error,
    ) {
        self.each("task_completed_with_problems", |l| {
            l.task_completed_with_problems(unit, duration, problem)
        });
    }

    fn each(&self, callback: &str, f: impl Fn(&dyn ExecutorListener)) {
        // Clone the list so a listener may register another one.
        let listeners = self.inner.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!(callback, "Executor listener panicked");
            }
        }
    }
}

/// Event form of the listener callbacks.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Accepted {
        unit: WorkUnit,
    },
    Completed {
        unit: WorkUnit,
        duration: Duration,
    },
    CompletedWithProblems {
        unit: WorkUnit,
        duration: Duration,
        message: String,
    },
}

impl ExecutorEvent {
    pub fn unit(&self) -> &WorkUnit {
        match self {
            ExecutorEvent::Accepted { unit }
            | ExecutorEvent::Completed { unit, .. }
            | ExecutorEvent::CompletedWithProblems { unit, .. } => unit,
        }
    }

    pub fn is_completion(&self) -> bool {
        !matches!(self, ExecutorEvent::Accepted { .. })
    }
}

/// Forwards callbacks into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ExecutorEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExecutorListener for ChannelListener {
    fn task_accepted(&self, unit: &WorkUnit) {
        let _ = self.tx.send(ExecutorEvent::Accepted { unit: unit.clone() });
    }

    fn task_completed(&self, unit: &WorkUnit, duration: Duration) {
        let _ = self.tx.send(ExecutorEvent::Completed {
            unit: unit.clone(),
            duration,
        });
    }

    fn task_completed_with_problems(&self, unit: &WorkUnit, duration: Duration, problem: &Error) {
        let _ = self.tx.send(ExecutorEvent::CompletedWithProblems {
            unit: unit.clone(),
            duration,
            message: problem.to_string(),
        });
    }
}
