//! State snapshots on disk.
//!
//! The coordinator periodically dumps its owned state (tasks and workers) to
//! a versioned JSON file and reloads it on startup. Derived state is never
//! written: worker assigned sets and the resource ledger are rebuilt from the
//! tasks after a load. A missing or unreadable snapshot is not an error; the
//! coordinator starts empty and workers re-register everything.

use crate::state::SchedulerState;
use chrono::{DateTime, Utc};
use foreman_core::{Task, TaskId, TaskStatus, Worker, WorkerId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything the coordinator persists.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub workers: Vec<Worker>,
}

impl Snapshot {
    /// Capture the owned state. Cheap enough to run under the state lock.
    pub fn capture(state: &SchedulerState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tasks: state.tasks.iter().cloned().collect(),
            workers: state.workers.iter().cloned().collect(),
        }
    }

    /// Load the snapshot into `state` and rebuild everything derived from
    /// it. A RUNNING task whose worker did not survive the round trip is
    /// repaired back to PENDING; the repaired tasks are returned so the
    /// caller can record the transitions.
    pub fn restore(
        self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
    ) -> Vec<(TaskId, Option<WorkerId>)> {
        for worker in self.workers {
            state.workers.insert(worker);
        }
        for task in self.tasks {
            state.tasks.insert(task);
        }
        state.rebuild_derived(now)
    }

    /// Count of RUNNING tasks, for the load-time log line.
    pub fn running_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Running)
            .count()
    }
}

/// Write the snapshot to `path`, creating parent directories as needed.
/// Writes to a sibling tmp file first and renames it into place so a crash
/// mid-write cannot leave a truncated snapshot behind.
pub fn save(path: &Path, snapshot: &Snapshot) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let bytes = serde_json::to_vec(snapshot)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Read a snapshot from `path`. Returns None when the file is missing,
/// unreadable, or does not parse; the caller starts empty in all of those
/// cases.
pub fn load(path: &Path) -> Option<Snapshot> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no state snapshot on disk");
            return None;
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "cannot read state snapshot; starting empty");
            return None;
        }
    };
    let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            warn!(path = %path.display(), %error, "corrupt state snapshot; starting empty");
            return None;
        }
    };
    if snapshot.version != SNAPSHOT_VERSION {
        warn!(
            version = snapshot.version,
            expected = SNAPSHOT_VERSION,
            "snapshot version differs; loading with defaults for new fields"
        );
    }
    Some(snapshot)
}
