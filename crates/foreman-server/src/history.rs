//! Task history hook.
//!
//! Every status transition the scheduler performs is offered to a
//! [`TaskHistory`] sink as a [`TaskEvent`]. Recording is fire-and-forget:
//! the scheduler never blocks on the sink and never fails an operation
//! because history could not be written.

use chrono::{DateTime, Utc};
use foreman_core::{Task, TaskId, TaskStatus, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Why a task changed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Registered (or re-registered) via add_task.
    Registered,
    /// Handed to a worker via get_work.
    Assigned,
    /// Reported complete by its assigned worker.
    Completed,
    /// Reported failed by its assigned worker.
    Failed,
    /// Disabled by the failure policy after too many recent failures.
    AutoDisabled,
    /// Disabled explicitly by an operator.
    AdminDisabled,
    /// Retry delay elapsed; back to PENDING.
    RetryExpired,
    /// Disable period elapsed; back to PENDING.
    DisableExpired,
    /// Re-enabled explicitly by an operator.
    Reenabled,
    /// A DONE task was re-registered with changed metadata for a fresh run.
    Rerun,
    /// Released because its worker went silent past the disconnect timeout
    /// or did not survive a restart of the coordinator.
    WorkerLost,
}

/// One status transition, as offered to history sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Unique id for this event.
    pub event_id: Uuid,
    /// Task the transition happened to.
    pub task_id: TaskId,
    /// Status after the transition.
    pub status: TaskStatus,
    /// Why the transition happened.
    pub cause: TransitionCause,
    /// Worker involved, when the cause names one.
    pub worker: Option<WorkerId>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Task parameters at the time of the transition.
    pub params: BTreeMap<String, String>,
}

impl TaskEvent {
    /// Capture an event from a task after its transition was applied.
    pub fn new(
        task: &Task,
        cause: TransitionCause,
        worker: Option<&WorkerId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            task_id: task.id.clone(),
            status: task.status,
            cause,
            worker: worker.cloned(),
            timestamp,
            params: task.params.clone(),
        }
    }
}

/// Sink for task status transitions.
///
/// Implementations must not block and must not fail the caller; the
/// scheduler records events while holding its state lock.
pub trait TaskHistory: Send + Sync {
    fn record(&self, event: TaskEvent);
}

/// Discards every event. The default when no history path is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopHistory;

impl TaskHistory for NopHistory {
    fn record(&self, _event: TaskEvent) {}
}

/// Appends events as JSON lines to a file.
///
/// Writes happen on a background task fed through an unbounded channel, so
/// `record` is a non-blocking send. If the writer dies (for example the
/// file could not be opened), later events are silently dropped.
pub struct JsonlHistory {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl JsonlHistory {
    /// Start the background writer. Must be called from within a tokio
    /// runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_events(path, rx));
        Self { tx }
    }
}

impl TaskHistory for JsonlHistory {
    fn record(&self, event: TaskEvent) {
        // Send failure means the writer is gone; history is best-effort.
        let _ = self.tx.send(event);
    }
}

async fn write_events(path: PathBuf, mut rx: mpsc::UnboundedReceiver<TaskEvent>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(error) => {
            warn!(path = %path.display(), %error, "cannot open task history file; history disabled");
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "failed to encode task history event");
                continue;
            }
        };
        line.push('\n');
        if let Err(error) = file.write_all(line.as_bytes()).await {
            warn!(path = %path.display(), %error, "failed to append task history event");
        }
    }
}
