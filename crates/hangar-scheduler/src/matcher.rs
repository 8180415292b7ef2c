//! Label matching: which computers may run a task.

use hangar_core::{Affinity, NodeMode};
use std::sync::Arc;

use crate::computer::Computer;

/// Decides whether a computer satisfies a task's affinity.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    controller: String,
}

impl LabelMatcher {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    /// Online, accepting tasks, and selected by the affinity. Roaming tasks
    /// skip exclusive nodes.
    pub fn can_take(&self, computer: &Computer, affinity: &Affinity) -> bool {
        if !computer.is_online() || !computer.is_accepting_tasks() {
            return false;
        }
        match affinity {
            Affinity::Roam => computer.mode() == NodeMode::Normal,
            Affinity::Controller => computer.name() == self.controller,
            Affinity::Label(expr) => computer.matches(expr),
        }
    }

    /// Computers able to take the affinity, in the given order.
    pub fn candidates(
        &self,
        computers: &[Arc<Computer>],
        affinity: &Affinity,
    ) -> Vec<Arc<Computer>> {
        computers
            .iter()
            .filter(|c| self.can_take(c, affinity))
            .cloned()
            .collect()
    }
}
