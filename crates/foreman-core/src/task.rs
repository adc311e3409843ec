//! Task entity and failure bookkeeping.

use crate::{TaskId, TaskStatus, WorkerId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Rolling window of recent failure timestamps.
///
/// Counting prunes entries older than the window first, so the window slides
/// as time advances. Successful completion clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl FailureWindow {
    /// Record a failure at the given instant.
    pub fn record(&mut self, at: DateTime<Utc>) {
        self.timestamps.push_back(at);
    }

    /// Count failures within `window` of `now`, pruning older entries.
    pub fn count_within(&mut self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        while let Some(oldest) = self.timestamps.front() {
            if *oldest < cutoff {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.len()
    }

    /// Most recent recorded failure, if any.
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.timestamps.back().copied()
    }

    /// Forget all recorded failures.
    pub fn clear(&mut self) {
        self.timestamps.clear();
    }

    /// True if no failures are recorded.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// A Task tracked by the coordinator.
///
/// The coordinator never sees task logic; a task is an identifier plus the
/// scheduling metadata its owner registered for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, chosen by the registering worker.
    pub id: TaskId,

    /// Current status.
    pub status: TaskStatus,

    /// Identifiers of tasks that must be DONE before this one may run.
    #[serde(default)]
    pub deps: BTreeSet<TaskId>,

    /// Resource units this task holds while RUNNING (name to amount).
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,

    /// Scheduling priority. Higher runs first; default 0.
    #[serde(default)]
    pub priority: i32,

    /// Opaque parameter map, echoed in views and history events.
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Worker currently executing this task (when RUNNING).
    #[serde(default)]
    pub assigned_worker: Option<WorkerId>,

    /// Connected workers that registered this task or one depending on it.
    /// A task no live worker references may be evicted once it goes idle.
    #[serde(default)]
    pub stakeholders: BTreeSet<WorkerId>,

    /// Registration-order tie-breaker; lower was registered earlier.
    pub sequence: u64,

    /// When the task was first registered (or first referenced).
    pub registered_at: DateTime<Utc>,

    /// Last time anything happened to this task. Drives eviction.
    pub last_activity: DateTime<Utc>,

    /// When the task last failed. Drives retry gating.
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,

    /// When a DISABLED task becomes eligible for re-enable by the pruner.
    /// None while disabled means an operator must re-enable explicitly.
    #[serde(default)]
    pub disabled_until: Option<DateTime<Utc>>,

    /// Recent failure timestamps for the disable policy.
    #[serde(default)]
    pub failures: FailureWindow,

    /// Message from the most recent failure report.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    /// Create a freshly registered PENDING task with empty metadata.
    pub fn new(id: TaskId, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            deps: BTreeSet::new(),
            resources: BTreeMap::new(),
            priority: 0,
            params: BTreeMap::new(),
            assigned_worker: None,
            stakeholders: BTreeSet::new(),
            sequence,
            registered_at: now,
            last_activity: now,
            last_failure: None,
            disabled_until: None,
            failures: FailureWindow::default(),
            last_error: None,
        }
    }

    /// Create an UNKNOWN placeholder for a task referenced as a dependency
    /// before being registered itself.
    pub fn placeholder(id: TaskId, sequence: u64, now: DateTime<Utc>) -> Self {
        let mut task = Self::new(id, sequence, now);
        task.status = TaskStatus::Unknown;
        task
    }

    /// Builder method to set dependencies.
    pub fn with_deps<I: IntoIterator<Item = TaskId>>(mut self, deps: I) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }

    /// Builder method to set a resource demand.
    pub fn with_resource(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// True if the given metadata is identical to what is already stored.
    pub fn metadata_matches(
        &self,
        deps: &BTreeSet<TaskId>,
        resources: &BTreeMap<String, u64>,
        priority: i32,
        params: &BTreeMap<String, String>,
    ) -> bool {
        self.deps == *deps
            && self.resources == *resources
            && self.priority == priority
            && self.params == *params
    }

    /// Replace the scheduling metadata.
    pub fn set_metadata(
        &mut self,
        deps: BTreeSet<TaskId>,
        resources: BTreeMap<String, u64>,
        priority: i32,
        params: BTreeMap<String, String>,
    ) {
        self.deps = deps;
        self.resources = resources;
        self.priority = priority;
        self.params = params;
    }

    /// Refresh the activity stamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Record a failure report at the given instant.
    pub fn record_failure(&mut self, now: DateTime<Utc>, message: Option<String>) {
        self.failures.record(now);
        self.last_failure = Some(now);
        if message.is_some() {
            self.last_error = message;
        }
    }

    /// Forget all failure bookkeeping. Used when a task completes, is
    /// re-enabled, or is re-registered for a fresh run.
    pub fn reset_failure_state(&mut self) {
        self.failures.clear();
        self.last_failure = None;
        self.last_error = None;
        self.disabled_until = None;
    }

    /// True once the retry delay since the last failure has elapsed.
    pub fn retry_elapsed(&self, retry_delay: Duration, now: DateTime<Utc>) -> bool {
        match self.last_failure {
            Some(failed_at) => now - failed_at >= retry_delay,
            // FAILED with no recorded failure instant retries immediately.
            None => true,
        }
    }
}
