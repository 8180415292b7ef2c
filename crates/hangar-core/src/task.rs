//! Tasks and the metadata attached to them while queued.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::label::LabelExpr;
use crate::resource::ResourceList;
use crate::{Error, Result, TaskId};

/// Where a task may run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Affinity {
    /// Any node that accepts roaming work.
    Roam,
    /// Only the controller node, via its self label.
    Controller,
    /// Nodes whose labels satisfy the expression.
    Label(LabelExpr),
}

impl Affinity {
    /// Parse a label string; `None` means the task roams.
    pub fn from_label(label: Option<&str>) -> Result<Self> {
        match label.map(str::trim) {
            None => Ok(Affinity::Roam),
            Some("") => Err(Error::Admission(
                "empty label expression; omit the label to roam".to_string(),
            )),
            Some(expr) => Ok(Affinity::Label(LabelExpr::parse(expr)?)),
        }
    }

    pub fn label(&self) -> Option<&LabelExpr> {
        match self {
            Affinity::Label(expr) => Some(expr),
            _ => None,
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Affinity::Roam => f.write_str("<any>"),
            Affinity::Controller => f.write_str("<controller>"),
            Affinity::Label(expr) => write!(f, "{}", expr),
        }
    }
}

/// Capacity class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskKind {
    /// Occupies one of a node's regular executor slots.
    #[default]
    Regular,
    /// Lightweight coordination work; runs on a one-off executor so it never
    /// holds a regular slot.
    Flyweight,
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identity used to collapse duplicate schedule requests.
    pub id: TaskId,
    /// Human-readable name.
    pub display_name: String,
    /// Node affinity.
    pub affinity: Affinity,
    /// Resources read or written while running.
    pub resources: ResourceList,
    /// Regular or flyweight.
    pub kind: TaskKind,
    /// Whether several runs of this task may execute at once.
    pub concurrent: bool,
    /// Expected run time, if known from history.
    pub estimated_duration: Option<Duration>,
    /// Command handed to the launcher.
    pub command: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>) -> Self {
        let id = id.into();
        Self {
            display_name: id.to_string(),
            id,
            affinity: Affinity::Roam,
            resources: ResourceList::new(),
            kind: TaskKind::Regular,
            concurrent: false,
            estimated_duration: None,
            command: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    /// Shorthand for an explicit label expression.
    pub fn with_label(mut self, expr: &str) -> Result<Self> {
        self.affinity = Affinity::from_label(Some(expr))?;
        Ok(self)
    }

    pub fn with_resources(mut self, resources: ResourceList) -> Self {
        self.resources = resources;
        self
    }

    pub fn flyweight(mut self) -> Self {
        self.kind = TaskKind::Flyweight;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = Some(duration);
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn is_flyweight(&self) -> bool {
        self.kind == TaskKind::Flyweight
    }

    /// Checks run by the queue before admission.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(Error::Admission("task id must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Why a task was scheduled. Implementations are open-ended; the queue only
/// needs a stable key to count duplicates.
pub trait Cause: fmt::Debug + Send + Sync {
    /// Kind tag, e.g. `"user"` or `"timer"`.
    fn kind(&self) -> &'static str;

    /// Causes with equal keys are the same cause and are counted, not
    /// repeated.
    fn key(&self) -> String;

    fn short_description(&self) -> String;
}

/// Started by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCause {
    pub user: String,
}

impl Cause for UserCause {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn key(&self) -> String {
        format!("user:{}", self.user)
    }

    fn short_description(&self) -> String {
        format!("Started by user {}", self.user)
    }
}

/// Started by a periodic trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerCause;

impl Cause for TimerCause {
    fn kind(&self) -> &'static str {
        "timer"
    }

    fn key(&self) -> String {
        "timer".to_string()
    }

    fn short_description(&self) -> String {
        "Started by timer".to_string()
    }
}

/// Started because an upstream build finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCause {
    pub project: String,
    pub build: u64,
}

impl Cause for UpstreamCause {
    fn kind(&self) -> &'static str {
        "upstream"
    }

    fn key(&self) -> String {
        format!("upstream:{}#{}", self.project, self.build)
    }

    fn short_description(&self) -> String {
        format!(
            "Started by upstream project \"{}\" build number {}",
            self.project, self.build
        )
    }
}

/// Started by a remote host, typically a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCause {
    pub addr: String,
    pub note: Option<String>,
}

impl Cause for RemoteCause {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn key(&self) -> String {
        format!("remote:{}:{}", self.addr, self.note.as_deref().unwrap_or(""))
    }

    fn short_description(&self) -> String {
        match &self.note {
            Some(note) => format!("Started by remote host {} with note: {}", self.addr, note),
            None => format!("Started by remote host {}", self.addr),
        }
    }
}

/// A cause rehydrated from a snapshot, whose original type is not known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredCause {
    pub kind: String,
    pub key: String,
    pub description: String,
}

impl Cause for RestoredCause {
    fn kind(&self) -> &'static str {
        "restored"
    }

    fn key(&self) -> String {
        self.key.clone()
    }

    fn short_description(&self) -> String {
        self.description.clone()
    }
}

/// A cause with the number of times it was reported for one item.
#[derive(Debug, Clone)]
pub struct CauseCount {
    pub cause: Arc<dyn Cause>,
    pub count: u32,
}

/// Counted causes of a queue item, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct CauseSet {
    entries: Vec<CauseCount>,
}

impl CauseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cause: Arc<dyn Cause>) {
        let key = cause.key();
        match self.entries.iter_mut().find(|e| e.cause.key() == key) {
            Some(existing) => existing.count += 1,
            None => self.entries.push(CauseCount { cause, count: 1 }),
        }
    }

    pub fn extend(&mut self, causes: impl IntoIterator<Item = Arc<dyn Cause>>) {
        for cause in causes {
            self.add(cause);
        }
    }

    /// Restore a counted entry, used when rehydrating snapshots.
    pub fn add_counted(&mut self, cause: Arc<dyn Cause>, count: u32) {
        let key = cause.key();
        match self.entries.iter_mut().find(|e| e.cause.key() == key) {
            Some(existing) => existing.count += count,
            None => self.entries.push(CauseCount { cause, count }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CauseCount> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_of(&self, key: &str) -> u32 {
        self.entries
            .iter()
            .find(|e| e.cause.key() == key)
            .map(|e| e.count)
            .unwrap_or(0)
    }
}

/// Metadata attached to a queued item that contributes to the run's
/// environment.
pub trait Action: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn build_env(&self, env: &mut BTreeMap<String, String>);
}

/// Plain key/value parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParametersAction {
    pub values: BTreeMap<String, String>,
}

impl ParametersAction {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

impl Action for ParametersAction {
    fn name(&self) -> &str {
        "parameters"
    }

    fn build_env(&self, env: &mut BTreeMap<String, String>) {
        env.extend(self.values.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_set_counts_duplicates() {
        let mut causes = CauseSet::new();
        causes.add(Arc::new(UserCause {
            user: "alice".to_string(),
        }));
        causes.add(Arc::new(TimerCause));
        causes.add(Arc::new(UserCause {
            user: "alice".to_string(),
        }));

        assert_eq!(causes.len(), 2);
        assert_eq!(causes.count_of("user:alice"), 2);
        assert_eq!(causes.count_of("timer"), 1);
    }

    #[test]
    fn test_affinity_from_label() {
        assert_eq!(Affinity::from_label(None).unwrap(), Affinity::Roam);
        assert!(matches!(
            Affinity::from_label(Some("  ")),
            Err(Error::Admission(_))
        ));
        assert!(matches!(
            Affinity::from_label(Some("linux && ")),
            Err(Error::InvalidLabel(_))
        ));
        let affinity = Affinity::from_label(Some("linux")).unwrap();
        assert_eq!(affinity.label(), Some(&LabelExpr::atom("linux")));
    }

    #[test]
    fn test_validate_rejects_blank_id() {
        assert!(Task::new("  ").validate().is_err());
        assert!(Task::new("build").validate().is_ok());
    }

    #[test]
    fn test_parameters_build_env() {
        let action = ParametersAction::new([("BRANCH".to_string(), "main".to_string())]);
        let mut env = BTreeMap::new();
        action.build_env(&mut env);
        assert_eq!(env.get("BRANCH").map(String::as_str), Some("main"));
    }
}
