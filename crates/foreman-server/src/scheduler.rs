//! The coordinator's scheduling operations.
//!
//! [`Scheduler`] wraps [`SchedulerState`] in a single mutex and exposes the
//! operations workers and operators call. Every operation locks, mutates,
//! and unlocks; none of them perform I/O under the lock. Time-based
//! transitions (retry expiry, disable expiry, worker loss, eviction) happen
//! only in [`Scheduler::prune`], driven by a timer, never lazily on reads.

use crate::config::SchedulerConfig;
use crate::history::{TaskEvent, TaskHistory, TransitionCause};
use crate::persistence::{self, Snapshot};
use crate::state::SchedulerState;
use chrono::{DateTime, Utc};
use foreman_core::{Clock, SchedulerError, Task, TaskId, TaskStatus, WorkerId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Registration request for a task, as sent by workers via `add_task`.
#[derive(Debug, Clone)]
pub struct AddTaskRequest {
    pub task_id: TaskId,
    pub deps: Vec<TaskId>,
    pub resources: BTreeMap<String, u64>,
    pub priority: i32,
    pub params: BTreeMap<String, String>,
    /// Worker registering the task, if any; upserted as a side effect.
    pub worker_id: Option<WorkerId>,
}

/// Reply to a `get_work` poll.
#[derive(Debug, Clone, Serialize)]
pub struct WorkReply {
    /// Task handed to the polling worker, or None when nothing is runnable.
    pub task_id: Option<TaskId>,
    /// PENDING tasks remaining after this assignment, runnable or not.
    pub n_pending_tasks: usize,
}

/// Read-only view of a task for `task_list`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub status: TaskStatus,
    pub deps: Vec<String>,
    pub resources: BTreeMap<String, u64>,
    pub priority: i32,
    pub params: BTreeMap<String, String>,
    pub worker_running: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl TaskView {
    fn from_task(task: &Task) -> Self {
        Self {
            status: task.status,
            deps: task.deps.iter().map(|dep| dep.to_string()).collect(),
            resources: task.resources.clone(),
            priority: task.priority,
            params: task.params.clone(),
            worker_running: task.assigned_worker.as_ref().map(|w| w.to_string()),
            last_activity: task.last_activity,
        }
    }
}

/// Read-only view of a worker for `worker_list`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub info: BTreeMap<String, String>,
    pub running: Vec<String>,
}

/// One node of a `dep_graph` reply.
#[derive(Debug, Clone, Serialize)]
pub struct DepGraphNode {
    pub status: TaskStatus,
    pub deps: Vec<String>,
}

/// Aggregate counters for metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub n_unknown: u64,
    pub n_pending: u64,
    pub n_running: u64,
    pub n_done: u64,
    pub n_failed: u64,
    pub n_disabled: u64,
    pub n_workers: u64,
    pub resources: Vec<ResourceStat>,
}

/// Capacity and usage of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStat {
    pub name: String,
    pub capacity: u64,
    pub in_use: u64,
}

/// The coordinator. One instance per process, shared behind an [`Arc`].
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    history: Arc<dyn TaskHistory>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        capacities: BTreeMap<String, u64>,
        clock: Arc<dyn Clock>,
        history: Arc<dyn TaskHistory>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::new(capacities)),
            config,
            clock,
            history,
        }
    }

    /// Lock the state. A poisoned mutex means an operation panicked while
    /// holding it, which leaves the state untrustworthy; crash loudly.
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler state mutex poisoned")
    }

    fn emit(
        &self,
        task: &Task,
        cause: TransitionCause,
        worker: Option<&WorkerId>,
        now: DateTime<Utc>,
    ) {
        self.history.record(TaskEvent::new(task, cause, worker, now));
    }

    /// Register a task, or re-register one the coordinator already knows.
    ///
    /// Forward dependency references create UNKNOWN placeholders. What
    /// re-registration does depends on the current status: UNKNOWN promotes
    /// to PENDING with a fresh sequence, PENDING and FAILED refresh metadata
    /// in place, RUNNING and DISABLED ignore the request, and DONE with
    /// changed metadata becomes a fresh PENDING rerun. A registering worker
    /// becomes a stakeholder of the task and its dependencies. Returns the
    /// task's status after the call.
    pub fn add_task(&self, req: AddTaskRequest) -> TaskStatus {
        let now = self.clock.now();
        let mut state = self.state();

        if let Some(worker_id) = &req.worker_id {
            state.workers.upsert(worker_id, now);
        }

        let deps: BTreeSet<TaskId> = req.deps.into_iter().collect();
        for dep in &deps {
            state.tasks.ensure_placeholder(dep, now);
        }

        // The stakeholder claim pins the whole registered subgraph against
        // eviction for as long as the worker stays connected.
        if let Some(worker_id) = &req.worker_id {
            for dep in &deps {
                if let Some(task) = state.tasks.get_mut(dep) {
                    task.stakeholders.insert(worker_id.clone());
                }
            }
            if let Some(task) = state.tasks.get_mut(&req.task_id) {
                task.stakeholders.insert(worker_id.clone());
            }
        }

        let existing = state.tasks.get(&req.task_id).map(|task| task.status);
        match existing {
            None => {
                let sequence = state.tasks.allocate_sequence();
                let mut task = Task::new(req.task_id, sequence, now);
                task.set_metadata(deps, req.resources, req.priority, req.params);
                if let Some(worker_id) = &req.worker_id {
                    task.stakeholders.insert(worker_id.clone());
                }
                info!(task_id = %task.id, "task registered");
                self.emit(&task, TransitionCause::Registered, req.worker_id.as_ref(), now);
                state.tasks.insert(task);
                TaskStatus::Pending
            }
            Some(TaskStatus::Unknown) => {
                // A placeholder becomes a real registration; it gets a fresh
                // sequence so it queues behind already-registered peers.
                let sequence = state.tasks.allocate_sequence();
                if let Some(task) = state.tasks.get_mut(&req.task_id) {
                    task.status = TaskStatus::Pending;
                    task.sequence = sequence;
                    task.set_metadata(deps, req.resources, req.priority, req.params);
                    task.touch(now);
                    info!(task_id = %task.id, "task registered");
                    self.emit(task, TransitionCause::Registered, req.worker_id.as_ref(), now);
                }
                TaskStatus::Pending
            }
            Some(status @ (TaskStatus::Pending | TaskStatus::Failed)) => {
                // Refresh metadata without disturbing status, sequence, or
                // failure bookkeeping.
                if let Some(task) = state.tasks.get_mut(&req.task_id) {
                    task.set_metadata(deps, req.resources, req.priority, req.params);
                    task.touch(now);
                }
                status
            }
            Some(status @ (TaskStatus::Running | TaskStatus::Disabled)) => status,
            Some(TaskStatus::Done) => {
                let identical = state.tasks.get(&req.task_id).is_some_and(|task| {
                    task.metadata_matches(&deps, &req.resources, req.priority, &req.params)
                });
                if identical {
                    return TaskStatus::Done;
                }
                // Changed metadata means the owner wants a fresh run.
                let sequence = state.tasks.allocate_sequence();
                if let Some(task) = state.tasks.get_mut(&req.task_id) {
                    task.status = TaskStatus::Pending;
                    task.sequence = sequence;
                    task.reset_failure_state();
                    task.set_metadata(deps, req.resources, req.priority, req.params);
                    task.touch(now);
                    info!(task_id = %task.id, "done task re-registered with new metadata; rerunning");
                    self.emit(task, TransitionCause::Rerun, req.worker_id.as_ref(), now);
                }
                TaskStatus::Pending
            }
        }
    }

    /// Hand the polling worker the best runnable task, if any.
    pub fn get_work(&self, worker_id: &WorkerId, host: Option<String>) -> WorkReply {
        let now = self.clock.now();
        let mut state = self.state();

        let worker = state.workers.upsert(worker_id, now);
        if let Some(host) = host {
            worker.set_info("host", host);
        }

        let selected = state.select_task();
        if let Some(task_id) = &selected {
            state.assign(task_id, worker_id, now);
            if let Some(task) = state.tasks.get(task_id) {
                info!(task_id = %task_id, worker_id = %worker_id, "task assigned");
                self.emit(task, TransitionCause::Assigned, Some(worker_id), now);
            }
        }

        // Counted after the assignment so the reply tells the worker what
        // is still waiting beyond the task it just received.
        let n_pending_tasks = state
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .count();

        WorkReply {
            task_id: selected,
            n_pending_tasks,
        }
    }

    /// Record a successful completion reported by the assigned worker.
    pub fn task_done(
        &self,
        worker_id: &WorkerId,
        task_id: &TaskId,
    ) -> Result<TaskStatus, SchedulerError> {
        let now = self.clock.now();
        let mut state = self.state();
        state.workers.upsert(worker_id, now);

        self.check_assignment(&state, task_id, worker_id)?;
        if let Some(task) = state.release(task_id, TaskStatus::Done, now) {
            task.reset_failure_state();
            info!(task_id = %task_id, worker_id = %worker_id, "task completed");
            self.emit(task, TransitionCause::Completed, Some(worker_id), now);
        }
        Ok(TaskStatus::Done)
    }

    /// Record a failure reported by the assigned worker.
    ///
    /// The task goes to FAILED and becomes eligible for retry once the retry
    /// delay elapses. If the failure pushes the task over the configured
    /// threshold within the rolling window, it is disabled instead.
    pub fn task_failed(
        &self,
        worker_id: &WorkerId,
        task_id: &TaskId,
        message: Option<String>,
    ) -> Result<TaskStatus, SchedulerError> {
        let now = self.clock.now();
        let disable_window = self.config.disable_window();
        let disable_persist = self.config.disable_persist();

        let mut state = self.state();
        state.workers.upsert(worker_id, now);

        self.check_assignment(&state, task_id, worker_id)?;
        let Some(task) = state.release(task_id, TaskStatus::Failed, now) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        task.record_failure(now, message);

        if let Some(threshold) = self.config.disable_failures {
            if task.failures.count_within(disable_window, now) >= threshold as usize {
                task.status = TaskStatus::Disabled;
                task.disabled_until = Some(now + disable_persist);
                task.failures.clear();
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    threshold,
                    "task exceeded failure threshold; disabled"
                );
                self.emit(task, TransitionCause::AutoDisabled, Some(worker_id), now);
                return Ok(TaskStatus::Disabled);
            }
        }

        info!(task_id = %task_id, worker_id = %worker_id, "task failed");
        self.emit(task, TransitionCause::Failed, Some(worker_id), now);
        Ok(TaskStatus::Failed)
    }

    fn check_assignment(
        &self,
        state: &SchedulerState,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) -> Result<(), SchedulerError> {
        let Some(task) = state.tasks.get(task_id) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        if task.assigned_worker.as_ref() != Some(worker_id) {
            return Err(SchedulerError::NotAssigned {
                task: task_id.to_string(),
                worker: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Exclude a task from scheduling until the disable period expires or an
    /// operator re-enables it. Disabling a DONE task is rejected; disabling
    /// an already DISABLED task is a no-op.
    pub fn disable_task(&self, task_id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let now = self.clock.now();
        let disable_persist = self.config.disable_persist();
        let mut state = self.state();

        let Some(task) = state.tasks.get(task_id) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        match task.status {
            TaskStatus::Done => Err(SchedulerError::InvalidTransition {
                task: task_id.to_string(),
                from: TaskStatus::Done.to_string(),
                to: TaskStatus::Disabled.to_string(),
            }),
            TaskStatus::Disabled => Ok(TaskStatus::Disabled),
            _ => {
                // Disabling a RUNNING task also releases its worker and
                // resources; the worker's eventual report will be rejected.
                if let Some(task) = state.release(task_id, TaskStatus::Disabled, now) {
                    task.disabled_until = Some(now + disable_persist);
                    warn!(task_id = %task_id, "task disabled by operator");
                    self.emit(task, TransitionCause::AdminDisabled, None, now);
                }
                Ok(TaskStatus::Disabled)
            }
        }
    }

    /// Put a DISABLED task back to PENDING, clearing its failure history.
    /// A task in any other status is left alone.
    pub fn re_enable_task(&self, task_id: &TaskId) -> Result<TaskStatus, SchedulerError> {
        let now = self.clock.now();
        let mut state = self.state();

        let Some(task) = state.tasks.get_mut(task_id) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        if task.status != TaskStatus::Disabled {
            return Ok(task.status);
        }
        task.status = TaskStatus::Pending;
        task.failures.clear();
        task.last_failure = None;
        // last_error is kept so the reason for the disable stays inspectable.
        task.disabled_until = None;
        task.touch(now);
        info!(task_id = %task_id, "task re-enabled");
        self.emit(task, TransitionCause::Reenabled, None, now);
        Ok(TaskStatus::Pending)
    }

    /// Liveness heartbeat from a worker with nothing else to say.
    pub fn ping(&self, worker_id: &WorkerId, host: Option<String>) {
        let now = self.clock.now();
        let mut state = self.state();
        let worker = state.workers.upsert(worker_id, now);
        if let Some(host) = host {
            worker.set_info("host", host);
        }
        debug!(worker_id = %worker_id, "worker ping");
    }

    /// List tasks, optionally filtered by status and id substring, capped at
    /// `max_shown_tasks` in registration order.
    pub fn task_list(
        &self,
        status: Option<TaskStatus>,
        search: Option<&str>,
    ) -> BTreeMap<String, TaskView> {
        let state = self.state();
        let mut matched: Vec<&Task> = state
            .tasks
            .iter()
            .filter(|task| status.map_or(true, |wanted| task.status == wanted))
            .filter(|task| search.map_or(true, |needle| task.id.as_str().contains(needle)))
            .collect();
        matched.sort_by_key(|task| task.sequence);
        matched.truncate(self.config.max_shown_tasks);
        matched
            .into_iter()
            .map(|task| (task.id.to_string(), TaskView::from_task(task)))
            .collect()
    }

    /// List every known worker with its current assignments.
    pub fn worker_list(&self) -> Vec<WorkerView> {
        let state = self.state();
        state
            .workers
            .iter()
            .map(|worker| WorkerView {
                worker_id: worker.id.to_string(),
                first_seen: worker.first_seen,
                last_seen: worker.last_seen,
                info: worker.info.clone(),
                running: worker.assigned.iter().map(|id| id.to_string()).collect(),
            })
            .collect()
    }

    /// The dependency closure reachable from `root`, capped at
    /// `max_shown_tasks` nodes. Unknown root yields an empty graph.
    pub fn dep_graph(&self, root: &TaskId) -> BTreeMap<String, DepGraphNode> {
        let state = self.state();
        let mut graph = BTreeMap::new();
        if !state.tasks.contains(root) {
            return graph;
        }

        let mut queue = VecDeque::from([root.clone()]);
        let mut seen: BTreeSet<TaskId> = BTreeSet::from([root.clone()]);
        while let Some(task_id) = queue.pop_front() {
            if graph.len() >= self.config.max_shown_tasks {
                break;
            }
            let Some(task) = state.tasks.get(&task_id) else {
                continue;
            };
            graph.insert(
                task_id.to_string(),
                DepGraphNode {
                    status: task.status,
                    deps: task.deps.iter().map(|dep| dep.to_string()).collect(),
                },
            );
            for dep in &task.deps {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
        graph
    }

    /// The most recent failure message reported for a task.
    pub fn fetch_error(&self, task_id: &TaskId) -> Result<Option<String>, SchedulerError> {
        let state = self.state();
        state
            .tasks
            .get(task_id)
            .map(|task| task.last_error.clone())
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))
    }

    /// Apply every time-based transition that has come due.
    ///
    /// Order matters: releasing a lost worker's tasks first lets the same
    /// sweep retry or evict them by the usual rules.
    pub fn prune(&self) {
        let now = self.clock.now();
        let mut state = self.state();

        self.remove_stale_workers(&mut state, now);
        self.promote_retries(&mut state, now);
        self.lift_expired_disables(&mut state, now);
        self.evict_stale_tasks(&mut state, now);

        if let Err(desync) = state.verify_consistency() {
            error!(%desync, "scheduler state failed consistency check after prune");
        }
    }

    fn remove_stale_workers(&self, state: &mut SchedulerState, now: DateTime<Utc>) {
        let timeout = self.config.worker_disconnect_delay();
        let stale: Vec<WorkerId> = state
            .workers
            .iter()
            .filter(|worker| worker.is_stale(timeout, now))
            .map(|worker| worker.id.clone())
            .collect();

        for worker_id in stale {
            let Some(worker) = state.workers.remove(&worker_id) else {
                continue;
            };
            warn!(
                worker_id = %worker_id,
                tasks = worker.assigned.len(),
                "worker timed out; releasing its tasks"
            );
            for task_id in worker.assigned {
                if let Some(task) = state.release(&task_id, TaskStatus::Pending, now) {
                    self.emit(task, TransitionCause::WorkerLost, Some(&worker_id), now);
                }
            }
            state.tasks.remove_stakeholder(&worker_id);
        }
    }

    fn promote_retries(&self, state: &mut SchedulerState, now: DateTime<Utc>) {
        let retry_delay = self.config.retry_delay();
        let due: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Failed && task.retry_elapsed(retry_delay, now)
            })
            .map(|task| task.id.clone())
            .collect();

        for task_id in due {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Pending;
                task.touch(now);
                debug!(task_id = %task_id, "retry delay elapsed; task back to pending");
                self.emit(task, TransitionCause::RetryExpired, None, now);
            }
        }
    }

    fn lift_expired_disables(&self, state: &mut SchedulerState, now: DateTime<Utc>) {
        let expired: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Disabled
                    && task.disabled_until.is_some_and(|until| now >= until)
            })
            .map(|task| task.id.clone())
            .collect();

        for task_id in expired {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Pending;
                task.disabled_until = None;
                task.failures.clear();
                task.touch(now);
                info!(task_id = %task_id, "disable period expired; task re-enabled");
                self.emit(task, TransitionCause::DisableExpired, None, now);
            }
        }
    }

    fn evict_stale_tasks(&self, state: &mut SchedulerState, now: DateTime<Utc>) {
        let remove_delay = self.config.remove_delay();
        // DISABLED tasks never age out: the sweep lifts the disable first and
        // the task ages from there as PENDING. A task with live stakeholders
        // is pinned no matter how long it idles.
        let candidates: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|task| {
                matches!(
                    task.status,
                    TaskStatus::Unknown | TaskStatus::Pending | TaskStatus::Done
                ) && task.stakeholders.is_empty()
                    && now - task.last_activity > remove_delay
            })
            .map(|task| task.id.clone())
            .collect();

        // Dependents are re-checked inside the loop: an eviction earlier in
        // the sweep can free a later candidate, and longer chains drain over
        // successive sweeps. A task something still depends on never goes.
        for task_id in candidates {
            if state.tasks.has_dependents(&task_id) {
                continue;
            }
            state.tasks.remove(&task_id);
            debug!(task_id = %task_id, "evicted stale task");
        }
    }

    /// Write a snapshot of the owned state to the configured path.
    pub fn dump(&self) {
        let snapshot = {
            let state = self.state();
            Snapshot::capture(&state)
        };
        let (tasks, workers) = (snapshot.tasks.len(), snapshot.workers.len());
        match persistence::save(&self.config.state_path, &snapshot) {
            Ok(()) => {
                info!(
                    path = %self.config.state_path.display(),
                    tasks,
                    workers,
                    "scheduler state dumped"
                );
            }
            Err(error) => {
                error!(
                    path = %self.config.state_path.display(),
                    %error,
                    "failed to dump scheduler state"
                );
            }
        }
    }

    /// Restore state from the configured snapshot path, if one exists.
    pub fn load(&self) {
        let Some(snapshot) = persistence::load(&self.config.state_path) else {
            info!("starting with empty scheduler state");
            return;
        };
        let now = self.clock.now();
        let (tasks, workers, running) = (
            snapshot.tasks.len(),
            snapshot.workers.len(),
            snapshot.running_tasks(),
        );
        let mut state = self.state();
        // Tasks repaired back to PENDING lost their worker across the
        // restart; the history gets the same cause as a runtime timeout.
        for (task_id, worker_id) in snapshot.restore(&mut state, now) {
            if let Some(task) = state.tasks.get(&task_id) {
                self.emit(task, TransitionCause::WorkerLost, worker_id.as_ref(), now);
            }
        }
        info!(tasks, workers, running, "scheduler state restored from snapshot");
    }

    /// Current aggregate counters, for metrics and health output.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.state();
        let mut stats = SchedulerStats::default();
        for task in state.tasks.iter() {
            match task.status {
                TaskStatus::Unknown => stats.n_unknown += 1,
                TaskStatus::Pending => stats.n_pending += 1,
                TaskStatus::Running => stats.n_running += 1,
                TaskStatus::Done => stats.n_done += 1,
                TaskStatus::Failed => stats.n_failed += 1,
                TaskStatus::Disabled => stats.n_disabled += 1,
            }
        }
        stats.n_workers = state.workers.len() as u64;

        let mut names: BTreeSet<&String> = state.ledger.capacities().keys().collect();
        names.extend(state.ledger.usage().keys());
        stats.resources = names
            .into_iter()
            .map(|name| ResourceStat {
                name: name.clone(),
                capacity: state.ledger.capacity_of(name),
                in_use: state.ledger.in_use_of(name),
            })
            .collect();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use foreman_core::SimulatedClock;

    #[derive(Default)]
    struct RecordingHistory {
        events: Mutex<Vec<TaskEvent>>,
    }

    impl RecordingHistory {
        fn causes_for(&self, task_id: &str) -> Vec<TransitionCause> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.task_id.as_str() == task_id)
                .map(|event| event.cause)
                .collect()
        }
    }

    impl TaskHistory for RecordingHistory {
        fn record(&self, event: TaskEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn harness_with(
        config: SchedulerConfig,
        capacities: BTreeMap<String, u64>,
    ) -> (Scheduler, Arc<SimulatedClock>, Arc<RecordingHistory>) {
        let clock = Arc::new(SimulatedClock::deterministic());
        let history = Arc::new(RecordingHistory::default());
        let scheduler = Scheduler::new(config, capacities, clock.clone(), history.clone());
        (scheduler, clock, history)
    }

    fn harness() -> (Scheduler, Arc<SimulatedClock>, Arc<RecordingHistory>) {
        harness_with(SchedulerConfig::default(), BTreeMap::new())
    }

    fn request(id: &str) -> AddTaskRequest {
        AddTaskRequest {
            task_id: TaskId::new(id),
            deps: Vec::new(),
            resources: BTreeMap::new(),
            priority: 0,
            params: BTreeMap::new(),
            worker_id: None,
        }
    }

    fn add(scheduler: &Scheduler, id: &str) -> TaskStatus {
        scheduler.add_task(request(id))
    }

    fn status_of(scheduler: &Scheduler, id: &str) -> Option<TaskStatus> {
        scheduler
            .state()
            .tasks
            .get(&TaskId::new(id))
            .map(|task| task.status)
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[test]
    fn test_add_task_registers_pending() {
        let (scheduler, _, history) = harness();
        assert_eq!(add(&scheduler, "A"), TaskStatus::Pending);
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        assert_eq!(history.causes_for("A"), vec![TransitionCause::Registered]);
    }

    #[test]
    fn test_add_task_creates_placeholders_for_deps() {
        let (scheduler, _, _) = harness();
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("B"), TaskId::new("C")],
            ..request("A")
        });
        assert_eq!(status_of(&scheduler, "B"), Some(TaskStatus::Unknown));
        assert_eq!(status_of(&scheduler, "C"), Some(TaskStatus::Unknown));

        // A is pending but blocked behind its unknown deps.
        let reply = scheduler.get_work(&worker("w1"), None);
        assert_eq!(reply.task_id, None);
        assert_eq!(reply.n_pending_tasks, 1);
    }

    #[test]
    fn test_add_task_records_stakeholders() {
        let (scheduler, _, _) = harness();
        let w = worker("w1");
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("Dep")],
            worker_id: Some(w.clone()),
            ..request("A")
        });
        add(&scheduler, "Anon");

        let state = scheduler.state();
        let claims = |id: &str| state.tasks.get(&TaskId::new(id)).unwrap().stakeholders.clone();
        assert!(claims("A").contains(&w));
        assert!(claims("Dep").contains(&w));
        assert!(claims("Anon").is_empty());
    }

    #[test]
    fn test_add_task_promotes_placeholder_with_fresh_sequence() {
        let (scheduler, _, history) = harness();
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("B")],
            ..request("A")
        });
        assert_eq!(add(&scheduler, "B"), TaskStatus::Pending);
        assert_eq!(status_of(&scheduler, "B"), Some(TaskStatus::Pending));
        assert_eq!(history.causes_for("B"), vec![TransitionCause::Registered]);

        // B queues behind any task registered between the placeholder and
        // its real registration.
        let state = scheduler.state();
        let a = state.tasks.get(&TaskId::new("A")).unwrap().sequence;
        let b = state.tasks.get(&TaskId::new("B")).unwrap().sequence;
        assert!(b > a);
    }

    #[test]
    fn test_add_task_refreshes_pending_metadata_in_place() {
        let (scheduler, _, history) = harness();
        add(&scheduler, "A");
        let sequence_before = scheduler
            .state()
            .tasks
            .get(&TaskId::new("A"))
            .unwrap()
            .sequence;

        let status = scheduler.add_task(AddTaskRequest {
            priority: 7,
            ..request("A")
        });
        assert_eq!(status, TaskStatus::Pending);

        let state = scheduler.state();
        let task = state.tasks.get(&TaskId::new("A")).unwrap();
        assert_eq!(task.priority, 7);
        assert_eq!(task.sequence, sequence_before);
        drop(state);
        // A refresh is not a new registration.
        assert_eq!(history.causes_for("A"), vec![TransitionCause::Registered]);
    }

    #[test]
    fn test_add_task_ignores_reregistration_while_running() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "A");
        scheduler.get_work(&worker("w1"), None);

        let status = scheduler.add_task(AddTaskRequest {
            priority: 9,
            ..request("A")
        });
        assert_eq!(status, TaskStatus::Running);
        let state = scheduler.state();
        let task = state.tasks.get(&TaskId::new("A")).unwrap();
        assert_eq!(task.priority, 0);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn test_add_task_done_identical_metadata_is_noop() {
        let (scheduler, _, history) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        scheduler.get_work(&w, None);
        scheduler.task_done(&w, &TaskId::new("A")).unwrap();

        assert_eq!(add(&scheduler, "A"), TaskStatus::Done);
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Done));
        assert!(!history.causes_for("A").contains(&TransitionCause::Rerun));
    }

    #[test]
    fn test_add_task_done_changed_metadata_triggers_rerun() {
        let (scheduler, _, history) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        scheduler.get_work(&w, None);
        scheduler.task_done(&w, &TaskId::new("A")).unwrap();
        let sequence_before = scheduler
            .state()
            .tasks
            .get(&TaskId::new("A"))
            .unwrap()
            .sequence;

        let status = scheduler.add_task(AddTaskRequest {
            priority: 2,
            ..request("A")
        });
        assert_eq!(status, TaskStatus::Pending);

        let state = scheduler.state();
        let task = state.tasks.get(&TaskId::new("A")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 2);
        assert!(task.sequence > sequence_before);
        assert!(task.failures.is_empty());
        assert_eq!(task.last_error, None);
        drop(state);
        assert!(history.causes_for("A").contains(&TransitionCause::Rerun));
    }

    #[test]
    fn test_add_task_failed_refreshes_but_stays_failed() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        scheduler.get_work(&w, None);
        scheduler
            .task_failed(&w, &TaskId::new("A"), Some("boom".to_string()))
            .unwrap();

        let status = scheduler.add_task(AddTaskRequest {
            priority: 3,
            ..request("A")
        });
        assert_eq!(status, TaskStatus::Failed);

        let state = scheduler.state();
        let task = state.tasks.get(&TaskId::new("A")).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.priority, 3);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_get_work_respects_priority_and_resources() {
        let (scheduler, _, _) = harness_with(
            SchedulerConfig::default(),
            BTreeMap::from([("gpu".to_string(), 2)]),
        );
        scheduler.add_task(AddTaskRequest {
            priority: 10,
            resources: BTreeMap::from([("gpu".to_string(), 2)]),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            priority: 5,
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("B")
        });
        scheduler.add_task(AddTaskRequest {
            priority: 1,
            ..request("C")
        });

        // A takes the whole gpu pool; B cannot fit, so C goes next.
        let w1 = worker("w1");
        let w2 = worker("w2");
        assert_eq!(scheduler.get_work(&w1, None).task_id, Some(TaskId::new("A")));
        assert_eq!(scheduler.get_work(&w2, None).task_id, Some(TaskId::new("C")));
        assert_eq!(scheduler.get_work(&w2, None).task_id, None);

        scheduler.task_done(&w1, &TaskId::new("A")).unwrap();
        assert_eq!(scheduler.get_work(&w1, None).task_id, Some(TaskId::new("B")));
    }

    #[test]
    fn test_get_work_exhausts_shared_resource() {
        let (scheduler, _, _) = harness_with(
            SchedulerConfig::default(),
            BTreeMap::from([("gpu".to_string(), 2)]),
        );
        for id in ["A", "B", "C"] {
            scheduler.add_task(AddTaskRequest {
                resources: BTreeMap::from([("gpu".to_string(), 1)]),
                ..request(id)
            });
        }

        // Two units of gpu serve two workers; the third polls empty even
        // though C is otherwise ready.
        assert_eq!(scheduler.get_work(&worker("w1"), None).task_id, Some(TaskId::new("A")));
        assert_eq!(scheduler.get_work(&worker("w2"), None).task_id, Some(TaskId::new("B")));
        let reply = scheduler.get_work(&worker("w3"), None);
        assert_eq!(reply.task_id, None);
        assert_eq!(reply.n_pending_tasks, 1);
    }

    #[test]
    fn test_get_work_breaks_priority_ties_by_registration_order() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "B");
        add(&scheduler, "A");
        // Same priority; B registered first despite sorting after A by id.
        assert_eq!(
            scheduler.get_work(&worker("w1"), None).task_id,
            Some(TaskId::new("B"))
        );
    }

    #[test]
    fn test_get_work_counts_pending_after_assignment() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "A");
        add(&scheduler, "B");

        let reply = scheduler.get_work(&worker("w1"), None);
        assert!(reply.task_id.is_some());
        assert_eq!(reply.n_pending_tasks, 1);

        let reply = scheduler.get_work(&worker("w2"), None);
        assert!(reply.task_id.is_some());
        assert_eq!(reply.n_pending_tasks, 0);
    }

    #[test]
    fn test_get_work_serializes_unconfigured_resource() {
        let (scheduler, _, _) = harness();
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("db".to_string(), 1)]),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("db".to_string(), 1)]),
            ..request("B")
        });

        // "db" was never configured, so it defaults to capacity 1.
        let w1 = worker("w1");
        assert_eq!(scheduler.get_work(&w1, None).task_id, Some(TaskId::new("A")));
        assert_eq!(scheduler.get_work(&worker("w2"), None).task_id, None);

        scheduler.task_done(&w1, &TaskId::new("A")).unwrap();
        assert_eq!(
            scheduler.get_work(&worker("w2"), None).task_id,
            Some(TaskId::new("B"))
        );
    }

    #[test]
    fn test_get_work_records_worker_host() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "A");
        scheduler.get_work(&worker("w1"), Some("host-7".to_string()));

        let workers = scheduler.worker_list();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "w1");
        assert_eq!(workers[0].info.get("host").map(String::as_str), Some("host-7"));
        assert_eq!(workers[0].running, vec!["A".to_string()]);
    }

    #[test]
    fn test_task_done_requires_assignment() {
        let (scheduler, _, _) = harness();
        let w = worker("w1");

        let err = scheduler.task_done(&w, &TaskId::new("ghost")).unwrap_err();
        assert!(err.is_not_found());

        add(&scheduler, "A");
        let err = scheduler.task_done(&w, &TaskId::new("A")).unwrap_err();
        assert!(matches!(err, SchedulerError::NotAssigned { .. }));

        scheduler.get_work(&w, None);
        let err = scheduler
            .task_done(&worker("impostor"), &TaskId::new("A"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotAssigned { .. }));

        // The rejected reports changed nothing.
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Running));
        assert_eq!(scheduler.task_done(&w, &TaskId::new("A")), Ok(TaskStatus::Done));
    }

    #[test]
    fn test_task_done_unblocks_dependents() {
        let (scheduler, _, _) = harness();
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("B")],
            ..request("A")
        });
        add(&scheduler, "B");

        let w = worker("w1");
        assert_eq!(scheduler.get_work(&w, None).task_id, Some(TaskId::new("B")));
        scheduler.task_done(&w, &TaskId::new("B")).unwrap();
        assert_eq!(scheduler.get_work(&w, None).task_id, Some(TaskId::new("A")));
    }

    #[test]
    fn test_task_done_clears_failure_history() {
        let (scheduler, clock, _) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");

        scheduler.get_work(&w, None);
        scheduler.task_failed(&w, &id, Some("boom".to_string())).unwrap();
        clock.advance(Duration::seconds(900));
        scheduler.prune();
        scheduler.get_work(&w, None);
        scheduler.task_done(&w, &id).unwrap();

        let state = scheduler.state();
        let task = state.tasks.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.failures.is_empty());
        assert_eq!(task.last_error, None);
        assert_eq!(task.last_failure, None);
    }

    #[test]
    fn test_task_failed_retries_after_delay() {
        let (scheduler, clock, _) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");

        scheduler.get_work(&w, None);
        let status = scheduler.task_failed(&w, &id, Some("boom".to_string())).unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(scheduler.fetch_error(&id), Ok(Some("boom".to_string())));

        // One second short of the retry delay: still failed.
        clock.advance(Duration::seconds(899));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Failed));
        assert_eq!(scheduler.get_work(&w, None).task_id, None);

        // At exactly the delay the pruner promotes it.
        clock.advance(Duration::seconds(1));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        // The error stays inspectable until the next outcome.
        assert_eq!(scheduler.fetch_error(&id), Ok(Some("boom".to_string())));
        assert_eq!(scheduler.get_work(&w, None).task_id, Some(id));
    }

    fn fail_cycle(scheduler: &Scheduler, clock: &SimulatedClock, id: &TaskId, w: &WorkerId) {
        // Promote a FAILED task back to PENDING, run it, and fail it again.
        clock.advance(Duration::seconds(900));
        scheduler.prune();
        assert_eq!(scheduler.get_work(w, None).task_id, Some(id.clone()));
        scheduler.task_failed(w, id, None).unwrap();
    }

    #[test]
    fn test_auto_disable_after_repeated_failures() {
        let config = SchedulerConfig {
            disable_failures: Some(3),
            ..SchedulerConfig::default()
        };
        let (scheduler, clock, history) = harness_with(config, BTreeMap::new());
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");

        // Failures at t=0, t=900, t=1800: all inside the 3600s window.
        scheduler.get_work(&w, None);
        scheduler.task_failed(&w, &id, None).unwrap();
        fail_cycle(&scheduler, &clock, &id, &w);
        fail_cycle(&scheduler, &clock, &id, &w);

        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Disabled));
        assert_eq!(scheduler.get_work(&w, None).task_id, None);
        assert!(history.causes_for("A").contains(&TransitionCause::AutoDisabled));

        let disabled_until = scheduler
            .state()
            .tasks
            .get(&id)
            .unwrap()
            .disabled_until
            .unwrap();
        assert_eq!(disabled_until, clock.now() + Duration::seconds(86_400));

        // The disable lifts once the persist period passes.
        clock.advance(Duration::seconds(86_400));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        assert!(history.causes_for("A").contains(&TransitionCause::DisableExpired));
    }

    #[test]
    fn test_failures_outside_window_do_not_disable() {
        let config = SchedulerConfig {
            disable_failures: Some(3),
            disable_window_secs: 1_000,
            ..SchedulerConfig::default()
        };
        let (scheduler, clock, _) = harness_with(config, BTreeMap::new());
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");

        // Each failure is 900s after the previous retry promotion, so at
        // most two ever share a 1000s window.
        scheduler.get_work(&w, None);
        scheduler.task_failed(&w, &id, None).unwrap();
        fail_cycle(&scheduler, &clock, &id, &w);
        fail_cycle(&scheduler, &clock, &id, &w);
        fail_cycle(&scheduler, &clock, &id, &w);

        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Failed));
    }

    #[test]
    fn test_disable_task_blocks_scheduling_and_is_idempotent() {
        let (scheduler, _, history) = harness();
        add(&scheduler, "A");
        let id = TaskId::new("A");

        assert_eq!(scheduler.disable_task(&id), Ok(TaskStatus::Disabled));
        assert_eq!(scheduler.get_work(&worker("w1"), None).task_id, None);

        assert_eq!(scheduler.disable_task(&id), Ok(TaskStatus::Disabled));
        assert_eq!(
            history.causes_for("A"),
            vec![TransitionCause::Registered, TransitionCause::AdminDisabled]
        );

        assert!(scheduler.disable_task(&TaskId::new("ghost")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_disable_running_task_releases_worker_and_resources() {
        let (scheduler, _, _) = harness_with(
            SchedulerConfig::default(),
            BTreeMap::from([("gpu".to_string(), 1)]),
        );
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("B")
        });

        let w = worker("w1");
        let id = TaskId::new("A");
        scheduler.get_work(&w, None);
        assert_eq!(scheduler.disable_task(&id), Ok(TaskStatus::Disabled));

        // The gpu unit is free again and the late report is rejected.
        assert_eq!(scheduler.get_work(&w, None).task_id, Some(TaskId::new("B")));
        let err = scheduler.task_done(&w, &id).unwrap_err();
        assert!(matches!(err, SchedulerError::NotAssigned { .. }));
    }

    #[test]
    fn test_disable_done_task_is_rejected() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");
        scheduler.get_work(&w, None);
        scheduler.task_done(&w, &id).unwrap();

        let err = scheduler.disable_task(&id).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Done));
    }

    #[test]
    fn test_admin_disable_expires_after_persist_period() {
        let (scheduler, clock, _) = harness();
        add(&scheduler, "A");
        let id = TaskId::new("A");
        scheduler.disable_task(&id).unwrap();

        clock.advance(Duration::seconds(86_399));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Disabled));

        clock.advance(Duration::seconds(1));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
    }

    #[test]
    fn test_disabled_task_is_never_evicted() {
        let config = SchedulerConfig {
            disable_failures: Some(3),
            ..SchedulerConfig::default()
        };
        let (scheduler, clock, history) = harness_with(config, BTreeMap::new());
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");

        // Failures at t=0, t=900, t=1800 trip the threshold.
        scheduler.get_work(&w, None);
        scheduler.task_failed(&w, &id, None).unwrap();
        fail_cycle(&scheduler, &clock, &id, &w);
        fail_cycle(&scheduler, &clock, &id, &w);
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Disabled));

        // Sweep every 60s across the disable period. The task idles far past
        // remove_delay the whole time and still has to sit out the full
        // 86400s rather than vanish.
        for _ in 0..1439 {
            clock.advance(Duration::seconds(60));
            scheduler.prune();
        }
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Disabled));

        clock.advance(Duration::seconds(60));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        assert!(history.causes_for("A").contains(&TransitionCause::DisableExpired));
    }

    #[test]
    fn test_re_enable_task() {
        let (scheduler, _, history) = harness();
        add(&scheduler, "A");
        let id = TaskId::new("A");
        scheduler.disable_task(&id).unwrap();

        assert_eq!(scheduler.re_enable_task(&id), Ok(TaskStatus::Pending));
        assert_eq!(
            scheduler.get_work(&worker("w1"), None).task_id,
            Some(id.clone())
        );
        assert!(history.causes_for("A").contains(&TransitionCause::Reenabled));

        // Not disabled: report the current status, change nothing.
        assert_eq!(scheduler.re_enable_task(&id), Ok(TaskStatus::Running));
        assert!(scheduler
            .re_enable_task(&TaskId::new("ghost"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_ping_registers_and_refreshes_worker() {
        let (scheduler, clock, _) = harness();
        scheduler.ping(&worker("w1"), Some("host-1".to_string()));

        let workers = scheduler.worker_list();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].info.get("host").map(String::as_str), Some("host-1"));

        clock.advance(Duration::seconds(40));
        scheduler.ping(&worker("w1"), None);
        let workers = scheduler.worker_list();
        assert_eq!(workers[0].last_seen, clock.now());
        assert_eq!(workers[0].first_seen, clock.now() - Duration::seconds(40));
    }

    #[test]
    fn test_worker_timeout_releases_its_tasks() {
        let (scheduler, clock, history) = harness_with(
            SchedulerConfig::default(),
            BTreeMap::from([("gpu".to_string(), 1)]),
        );
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("A")
        });
        let w1 = worker("w1");
        scheduler.get_work(&w1, None);

        clock.advance(Duration::seconds(61));
        scheduler.prune();

        assert!(scheduler.worker_list().is_empty());
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        assert!(history.causes_for("A").contains(&TransitionCause::WorkerLost));

        // Resources came back with the task; another worker picks it up.
        assert_eq!(
            scheduler.get_work(&worker("w2"), None).task_id,
            Some(TaskId::new("A"))
        );
    }

    #[test]
    fn test_pinging_worker_keeps_its_running_task() {
        let (scheduler, clock, _) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        scheduler.get_work(&w, None);

        // Task activity stamp ages past remove_delay, but RUNNING tasks are
        // never evicted and the worker never goes stale.
        for _ in 0..14 {
            clock.advance(Duration::seconds(50));
            scheduler.ping(&w, None);
            scheduler.prune();
        }
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Running));
        assert_eq!(scheduler.worker_list().len(), 1);
    }

    #[test]
    fn test_eviction_protects_tasks_with_dependents() {
        let (scheduler, clock, _) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        scheduler.get_work(&w, None);
        scheduler.task_done(&w, &TaskId::new("A")).unwrap();
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("A")],
            ..request("B")
        });

        clock.advance(Duration::seconds(601));
        scheduler.prune();

        // B had no dependents and went; A was protected by B this sweep.
        // (Candidates are visited in id order, so A was checked first.)
        assert_eq!(status_of(&scheduler, "B"), None);
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Done));

        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), None);
    }

    #[test]
    fn test_eviction_cascades_through_placeholders() {
        let (scheduler, clock, _) = harness();
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("Ghost")],
            ..request("A")
        });

        clock.advance(Duration::seconds(601));
        scheduler.prune();

        // A goes first (id order), freeing the Ghost placeholder in the
        // same sweep.
        assert_eq!(status_of(&scheduler, "A"), None);
        assert_eq!(status_of(&scheduler, "Ghost"), None);
    }

    #[test]
    fn test_blocked_task_outlives_long_running_dependency() {
        let (scheduler, clock, _) = harness();
        let w = worker("w1");
        scheduler.add_task(AddTaskRequest {
            worker_id: Some(w.clone()),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("A")],
            worker_id: Some(w.clone()),
            ..request("B")
        });
        assert_eq!(scheduler.get_work(&w, None).task_id, Some(TaskId::new("A")));

        // A runs for 15 minutes while its worker polls every minute. B sits
        // blocked and untouched well past remove_delay; the live stakeholder
        // keeps it registered.
        for _ in 0..15 {
            clock.advance(Duration::seconds(60));
            assert_eq!(scheduler.get_work(&w, None).task_id, None);
            scheduler.prune();
        }

        scheduler.task_done(&w, &TaskId::new("A")).unwrap();
        assert_eq!(scheduler.get_work(&w, None).task_id, Some(TaskId::new("B")));
    }

    #[test]
    fn test_abandoned_tasks_age_out_after_worker_departs() {
        let (scheduler, clock, _) = harness();
        let w = worker("w1");
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("Ghost")],
            worker_id: Some(w.clone()),
            ..request("A")
        });

        // Blocked behind a dependency nobody registers and idle past
        // remove_delay, but the registering worker is still connected.
        clock.advance(Duration::seconds(50));
        scheduler.ping(&w, None);
        clock.advance(Duration::seconds(551));
        scheduler.ping(&w, None);
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        assert_eq!(status_of(&scheduler, "Ghost"), Some(TaskStatus::Unknown));

        // Once the worker goes silent the sweep drops it, and with it the
        // last claim on the idle tasks.
        clock.advance(Duration::seconds(61));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), None);
        assert_eq!(status_of(&scheduler, "Ghost"), None);
    }

    #[test]
    fn test_failed_tasks_are_never_evicted() {
        let config = SchedulerConfig {
            retry_delay_secs: 100_000,
            ..SchedulerConfig::default()
        };
        let (scheduler, clock, _) = harness_with(config, BTreeMap::new());
        add(&scheduler, "A");
        let w = worker("w1");
        scheduler.get_work(&w, None);
        scheduler.task_failed(&w, &TaskId::new("A"), None).unwrap();

        // Far past remove_delay, far short of the retry delay.
        clock.advance(Duration::seconds(10_000));
        scheduler.prune();
        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Failed));
    }

    #[test]
    fn test_task_list_filters_and_caps() {
        let config = SchedulerConfig {
            max_shown_tasks: 2,
            ..SchedulerConfig::default()
        };
        let (scheduler, _, _) = harness_with(config, BTreeMap::new());
        add(&scheduler, "DailyReport");
        add(&scheduler, "DailyCleanup");
        add(&scheduler, "Backfill");
        let w = worker("w1");
        scheduler.get_work(&w, None); // assigns DailyReport, registered first

        let running = scheduler.task_list(Some(TaskStatus::Running), None);
        assert_eq!(running.len(), 1);
        assert!(running.contains_key("DailyReport"));
        assert_eq!(
            running["DailyReport"].worker_running.as_deref(),
            Some("w1")
        );

        let daily = scheduler.task_list(None, Some("Daily"));
        assert_eq!(daily.len(), 2);
        assert!(daily.contains_key("DailyReport"));
        assert!(daily.contains_key("DailyCleanup"));

        let pending_daily = scheduler.task_list(Some(TaskStatus::Pending), Some("Daily"));
        assert_eq!(pending_daily.len(), 1);
        assert!(pending_daily.contains_key("DailyCleanup"));

        // Unfiltered output is capped at max_shown_tasks, earliest first.
        let capped = scheduler.task_list(None, None);
        assert_eq!(capped.len(), 2);
        assert!(capped.contains_key("DailyReport"));
        assert!(capped.contains_key("DailyCleanup"));
    }

    #[test]
    fn test_dep_graph_walks_transitive_deps() {
        let (scheduler, _, _) = harness();
        add(&scheduler, "D");
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("D")],
            ..request("B")
        });
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("D")],
            ..request("C")
        });
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("B"), TaskId::new("C")],
            ..request("A")
        });
        add(&scheduler, "Unrelated");

        let graph = scheduler.dep_graph(&TaskId::new("A"));
        assert_eq!(graph.len(), 4);
        assert!(graph.contains_key("A"));
        assert!(graph.contains_key("B"));
        assert!(graph.contains_key("C"));
        assert!(graph.contains_key("D"));
        assert!(!graph.contains_key("Unrelated"));
        assert_eq!(graph["A"].deps, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(graph["D"].status, TaskStatus::Pending);

        assert!(scheduler.dep_graph(&TaskId::new("ghost")).is_empty());
    }

    #[test]
    fn test_fetch_error() {
        let (scheduler, _, _) = harness();
        assert!(scheduler.fetch_error(&TaskId::new("ghost")).unwrap_err().is_not_found());

        add(&scheduler, "A");
        assert_eq!(scheduler.fetch_error(&TaskId::new("A")), Ok(None));

        let w = worker("w1");
        scheduler.get_work(&w, None);
        scheduler
            .task_failed(&w, &TaskId::new("A"), Some("stack trace here".to_string()))
            .unwrap();
        assert_eq!(
            scheduler.fetch_error(&TaskId::new("A")),
            Ok(Some("stack trace here".to_string()))
        );
    }

    #[test]
    fn test_dump_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            state_path: dir.path().join("state.json"),
            ..SchedulerConfig::default()
        };
        let capacities = BTreeMap::from([("gpu".to_string(), 2)]);

        let (scheduler, _, _) = harness_with(config.clone(), capacities.clone());
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("A")],
            params: BTreeMap::from([("date".to_string(), "2024-01-01".to_string())]),
            ..request("B")
        });
        let w = worker("w1");
        scheduler.get_work(&w, Some("host-1".to_string()));
        scheduler.dump();

        let (restored, _, _) = harness_with(config, capacities);
        restored.load();

        let before = scheduler.state();
        let after = restored.state();
        let tasks_before: Vec<&Task> = before.tasks.iter().collect();
        let tasks_after: Vec<&Task> = after.tasks.iter().collect();
        assert_eq!(tasks_before, tasks_after);
        assert_eq!(before.workers.len(), after.workers.len());
        assert_eq!(before.ledger.usage(), after.ledger.usage());
        assert!(after.verify_consistency().is_ok());

        // The restored RUNNING task is still owned by its worker.
        assert!(after
            .workers
            .get(&w)
            .unwrap()
            .assigned
            .contains(&TaskId::new("A")));
    }

    #[test]
    fn test_load_records_worker_lost_for_repaired_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            state_path: dir.path().join("state.json"),
            ..SchedulerConfig::default()
        };
        // A snapshot holding a RUNNING task whose worker was never dumped.
        let json = r#"{
            "version": 1,
            "tasks": [{
                "id": "A",
                "status": "RUNNING",
                "assigned_worker": "w-gone",
                "sequence": 0,
                "registered_at": "2024-01-01T00:00:00Z",
                "last_activity": "2024-01-01T00:00:00Z"
            }],
            "workers": []
        }"#;
        std::fs::write(&config.state_path, json).unwrap();

        let (scheduler, _, history) = harness_with(config, BTreeMap::new());
        scheduler.load();

        assert_eq!(status_of(&scheduler, "A"), Some(TaskStatus::Pending));
        assert_eq!(history.causes_for("A"), vec![TransitionCause::WorkerLost]);
    }

    #[test]
    fn test_history_records_full_lifecycle() {
        let (scheduler, clock, history) = harness();
        add(&scheduler, "A");
        let w = worker("w1");
        let id = TaskId::new("A");

        scheduler.get_work(&w, None);
        scheduler.task_failed(&w, &id, None).unwrap();
        clock.advance(Duration::seconds(900));
        scheduler.prune();
        scheduler.get_work(&w, None);
        scheduler.task_done(&w, &id).unwrap();

        assert_eq!(
            history.causes_for("A"),
            vec![
                TransitionCause::Registered,
                TransitionCause::Assigned,
                TransitionCause::Failed,
                TransitionCause::RetryExpired,
                TransitionCause::Assigned,
                TransitionCause::Completed,
            ]
        );
    }

    #[test]
    fn test_state_stays_consistent_through_mixed_operations() {
        let (scheduler, clock, _) = harness_with(
            SchedulerConfig::default(),
            BTreeMap::from([("gpu".to_string(), 2)]),
        );
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("A")],
            ..request("B")
        });
        add(&scheduler, "C");

        let w1 = worker("w1");
        let w2 = worker("w2");
        scheduler.get_work(&w1, None);
        scheduler.get_work(&w2, None);
        scheduler.task_done(&w1, &TaskId::new("A")).unwrap();
        scheduler.task_failed(&w2, &TaskId::new("C"), None).unwrap();
        scheduler.get_work(&w1, None); // picks up B
        scheduler.disable_task(&TaskId::new("C")).unwrap();

        assert!(scheduler.state().verify_consistency().is_ok());

        clock.advance(Duration::seconds(3_600));
        scheduler.prune();
        assert!(scheduler.state().verify_consistency().is_ok());
    }

    #[test]
    fn test_stats_counts_statuses_and_resources() {
        let (scheduler, _, _) = harness_with(
            SchedulerConfig::default(),
            BTreeMap::from([("gpu".to_string(), 2)]),
        );
        scheduler.add_task(AddTaskRequest {
            resources: BTreeMap::from([("gpu".to_string(), 1)]),
            ..request("A")
        });
        scheduler.add_task(AddTaskRequest {
            deps: vec![TaskId::new("Ghost")],
            ..request("B")
        });
        let w = worker("w1");
        scheduler.get_work(&w, None);

        let stats = scheduler.stats();
        assert_eq!(stats.n_running, 1);
        assert_eq!(stats.n_pending, 1);
        assert_eq!(stats.n_unknown, 1);
        assert_eq!(stats.n_done, 0);
        assert_eq!(stats.n_workers, 1);
        assert_eq!(stats.resources.len(), 1);
        assert_eq!(stats.resources[0].name, "gpu");
        assert_eq!(stats.resources[0].capacity, 2);
        assert_eq!(stats.resources[0].in_use, 1);
    }
}
