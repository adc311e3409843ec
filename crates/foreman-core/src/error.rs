//! Core domain errors.

use thiserror::Error;

/// Errors returned by coordinator operations.
///
/// Every variant is a caller-visible rejection; none of them leave state
/// modified. Invariant violations are not represented here since they are
/// bugs, not conditions callers can cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The named task is not in the registry.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A worker reported an outcome for a task it was never assigned.
    #[error("task '{task}' is not assigned to worker '{worker}'")]
    NotAssigned { task: String, worker: String },

    /// The requested transition is not allowed from the task's current
    /// status (for example, disabling a DONE task).
    #[error("invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },
}

impl SchedulerError {
    /// True for errors caused by referencing something that does not exist,
    /// as opposed to an operation rejected by policy.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_))
    }
}
