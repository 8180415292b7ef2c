//! Saving pending work across restarts.

use chrono::{DateTime, Utc};
use hangar_core::{
    Action, CauseSet, ItemState, ParametersAction, QueueItem, RestoredCause, Result, Task,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::load::LoadStatistics;

const SNAPSHOT_VERSION: u32 = 1;

/// Persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub items: Vec<ItemRecord>,
    pub overall: Option<LoadStatistics>,
    #[serde(default)]
    pub labels: BTreeMap<String, LoadStatistics>,
}

impl EngineSnapshot {
    pub fn new(
        items: Vec<ItemRecord>,
        overall: Option<LoadStatistics>,
        labels: BTreeMap<String, LoadStatistics>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            items,
            overall,
            labels,
        }
    }
}

/// A pending item in persisted form. Causes keep their key and description;
/// actions are flattened into the environment they contribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub task: Task,
    pub in_queue_since: DateTime<Utc>,
    pub quiet_remaining: Duration,
    pub causes: Vec<CauseRecord>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseRecord {
    pub kind: String,
    pub key: String,
    pub description: String,
    pub count: u32,
}

impl ItemRecord {
    pub fn from_item(item: &QueueItem, now: Instant) -> Self {
        let quiet_remaining = match item.state {
            ItemState::Waiting => item.quiet_remaining(now),
            _ => Duration::ZERO,
        };
        Self {
            task: (*item.task).clone(),
            in_queue_since: item.in_queue_since,
            quiet_remaining,
            causes: item
                .causes
                .iter()
                .map(|c| CauseRecord {
                    kind: c.cause.kind().to_string(),
                    key: c.cause.key(),
                    description: c.cause.short_description(),
                    count: c.count,
                })
                .collect(),
            env: item.env(),
        }
    }

    pub fn causes(&self) -> CauseSet {
        let mut set = CauseSet::new();
        for c in &self.causes {
            set.add_counted(
                Arc::new(RestoredCause {
                    kind: c.kind.clone(),
                    key: c.key.clone(),
                    description: c.description.clone(),
                }),
                c.count,
            );
        }
        set
    }

    pub fn actions(&self) -> Vec<Arc<dyn Action>> {
        if self.env.is_empty() {
            return Vec::new();
        }
        vec![Arc::new(ParametersAction::new(self.env.clone()))]
    }
}

/// Where snapshots live.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Option<EngineSnapshot>>;

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// Snapshot in a single JSON file, replaced atomically on save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadSample;
    use hangar_core::{ItemId, UserCause};
    use tempfile::TempDir;

    fn item() -> QueueItem {
        let mut causes = CauseSet::new();
        causes.add_counted(
            Arc::new(UserCause {
                user: "ann".to_string(),
            }),
            2,
        );
        let now = Instant::now();
        QueueItem {
            id: ItemId::new(7),
            task: Arc::new(Task::new("build").with_label("linux").unwrap()),
            state: ItemState::Waiting,
            in_queue_since: Utc::now(),
            deadline: now + Duration::from_secs(30),
            causes,
            actions: vec![Arc::new(ParametersAction::new([(
                "BRANCH".to_string(),
                "main".to_string(),
            )]))],
        }
    }

    #[tokio::test]
    async fn test_item_record_keeps_causes_and_env() {
        let item = item();
        let record = ItemRecord::from_item(&item, Instant::now());
        assert!(record.quiet_remaining <= Duration::from_secs(30));
        assert!(record.quiet_remaining > Duration::from_secs(25));

        let causes = record.causes();
        assert_eq!(causes.count_of("user:ann"), 2);
        let mut env = BTreeMap::new();
        for action in record.actions() {
            action.build_env(&mut env);
        }
        assert_eq!(env.get("BRANCH").map(String::as_str), Some("main"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("state/queue.json"));
        assert!(store.load().unwrap().is_none());

        let mut labels = BTreeMap::new();
        labels.insert(
            "linux".to_string(),
            LoadStatistics::new(0.9, &LoadSample::default(), false),
        );
        let snapshot = EngineSnapshot::new(
            vec![ItemRecord::from_item(&item(), Instant::now())],
            Some(LoadStatistics::new(0.9, &LoadSample::default(), true)),
            labels,
        );
        store.save(&snapshot).unwrap();
        assert!(!store.temp_path().exists());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].task.id.as_str(), "build");
        assert_eq!(loaded.items[0].causes, snapshot.items[0].causes);
        assert_eq!(loaded.labels.len(), 1);
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        fs::write(&path, b"[").unwrap();
        assert!(JsonFileStore::new(path).load().is_err());
    }
}
