//! Build record cleanup.
//!
//! Build records are JSON files under a records directory, one per build,
//! each listing the artifacts the build produced. Once none of those
//! artifacts exist any more the record is useless and gets deleted, along
//! with any directory left empty.

use chrono::{DateTime, Utc};
use hangar_core::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::periodic::AsyncPeriodicWork;

/// One build's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub task: String,
    pub number: u64,
    /// Artifact paths; relative ones are resolved against the record's
    /// directory.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// Whether any artifact still exists.
    pub fn is_alive(&self, base: &Path) -> bool {
        self.artifacts.iter().any(|a| base.join(a).exists())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub unreadable: usize,
}

pub struct RecordCleanup {
    dir: PathBuf,
    period: Duration,
}

impl RecordCleanup {
    pub fn new(dir: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            dir: dir.into(),
            period,
        }
    }

    /// Sweep the records directory once. Unreadable records are left alone.
    pub fn clean(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if self.dir.is_dir() {
            self.sweep(&self.dir, &mut report)?;
        }
        Ok(report)
    }

    fn sweep(&self, dir: &Path, report: &mut CleanupReport) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.sweep(&path, report)?;
                delete_if_empty(&path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            report.scanned += 1;
            match read_record(&path) {
                Ok(record) if !record.is_alive(dir) => {
                    fs::remove_file(&path)?;
                    report.deleted += 1;
                    debug!(record = %path.display(), task = %record.task, number = record.number, "Deleted dead build record");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(record = %path.display(), error = %e, "Skipping unreadable build record");
                    report.unreadable += 1;
                }
            }
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<BuildRecord> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn delete_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        if let Err(e) = fs::remove_dir(dir) {
            debug!(dir = %dir.display(), error = %e, "Could not remove empty directory");
        }
    }
}

impl AsyncPeriodicWork for RecordCleanup {
    fn name(&self) -> &str {
        "record-cleanup"
    }

    fn recurrence_period(&self) -> Duration {
        self.period
    }

    fn execute(&self) -> Result<()> {
        let report = self.clean()?;
        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            unreadable = report.unreadable,
            "Build record cleanup finished"
        );
        Ok(())
    }
}
