//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task in the coordinator.
///
/// Transitions are driven by worker reports (`get_work`, `task_done`,
/// `task_failed`), by admin actions (disable/re-enable), and by the pruner
/// sweep (retry expiry, disable expiry, worker loss).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Placeholder created when a task is first referenced as a dependency
    /// but has not been registered itself. Never schedulable.
    Unknown,
    /// Registered and waiting for its dependencies to complete.
    #[default]
    Pending,
    /// Handed to a worker via `get_work`; holds its declared resources.
    Running,
    /// Reported complete by its assigned worker.
    Done,
    /// Reported failed; eligible for retry after the retry delay.
    Failed,
    /// Excluded from scheduling until the disable period expires or an
    /// explicit re-enable.
    Disabled,
}

impl TaskStatus {
    /// Returns true if the task can be handed to a worker once its
    /// dependencies are satisfied.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns true if the status satisfies a dependency edge.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Disabled => "DISABLED",
        }
    }

    /// Parse a wire name. Used by the task_list status filter.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNKNOWN" => Some(Self::Unknown),
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "DONE" => Some(Self::Done),
            "FAILED" => Some(Self::Failed),
            "DISABLED" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
