//! Scheduler state: the task and worker registries and the resource ledger.
//!
//! Everything the coordinator knows lives in one [`SchedulerState`] aggregate.
//! Operations lock it, read and mutate it, and release it; no state leaks out
//! behind separate locks. The mutation helpers here ([`SchedulerState::assign`]
//! and [`SchedulerState::release`]) are the only code paths that touch a task's
//! assignment, the owning worker's task set, and the resource ledger, which is
//! what keeps the three views of "who is running what" from drifting apart.

use chrono::{DateTime, Utc};
use foreman_core::{ResourceLedger, Task, TaskId, TaskStatus, Worker, WorkerId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Owns every task the coordinator knows about, keyed by id.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskId, Task>,
    next_sequence: u64,
}

impl TaskRegistry {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.values_mut()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a task, keeping the sequence counter ahead of every stored
    /// sequence so restored snapshots cannot collide with new registrations.
    pub fn insert(&mut self, task: Task) {
        self.next_sequence = self.next_sequence.max(task.sequence + 1);
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        self.tasks.remove(id)
    }

    /// Allocate the next registration-order sequence number.
    pub fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Create an UNKNOWN placeholder for a dependency reference unless the
    /// task already exists.
    pub fn ensure_placeholder(&mut self, id: &TaskId, now: DateTime<Utc>) {
        if !self.tasks.contains_key(id) {
            let sequence = self.allocate_sequence();
            self.tasks
                .insert(id.clone(), Task::placeholder(id.clone(), sequence, now));
        }
    }

    /// True if any registered task lists `id` among its dependencies.
    pub fn has_dependents(&self, id: &TaskId) -> bool {
        self.tasks.values().any(|task| task.deps.contains(id))
    }

    /// Strip a departed worker from every task's stakeholder set. Stakeholder
    /// sets only ever name workers present in the worker registry.
    pub fn remove_stakeholder(&mut self, worker_id: &WorkerId) {
        for task in self.tasks.values_mut() {
            task.stakeholders.remove(worker_id);
        }
    }
}

/// Owns every worker the coordinator has heard from, keyed by id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, Worker>,
}

impl WorkerRegistry {
    pub fn get(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Worker> {
        self.workers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn insert(&mut self, worker: Worker) {
        self.workers.insert(worker.id.clone(), worker);
    }

    pub fn remove(&mut self, id: &WorkerId) -> Option<Worker> {
        self.workers.remove(id)
    }

    /// Register the worker on first contact and refresh its liveness stamp
    /// either way. Every RPC that names a worker goes through here.
    pub fn upsert(&mut self, id: &WorkerId, now: DateTime<Utc>) -> &mut Worker {
        let worker = self
            .workers
            .entry(id.clone())
            .or_insert_with(|| Worker::new(id.clone(), now));
        worker.touch(now);
        worker
    }
}

/// The single owned aggregate behind the coordinator's mutex.
#[derive(Debug)]
pub struct SchedulerState {
    pub tasks: TaskRegistry,
    pub workers: WorkerRegistry,
    pub ledger: ResourceLedger,
}

impl SchedulerState {
    pub fn new(capacities: BTreeMap<String, u64>) -> Self {
        Self {
            tasks: TaskRegistry::default(),
            workers: WorkerRegistry::default(),
            ledger: ResourceLedger::new(capacities),
        }
    }

    /// True if the task could be handed out right now, resources aside:
    /// PENDING with every dependency DONE. A dependency that is missing,
    /// UNKNOWN, or in any other non-DONE status blocks readiness.
    pub fn is_ready(&self, task: &Task) -> bool {
        task.status.is_schedulable()
            && task.deps.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|t| t.status.satisfies_dependency())
            })
    }

    /// Pick the task a polling worker should run next: ready, and its
    /// resource demand fits in the free capacity. Highest priority wins,
    /// ties go to the earliest registered task.
    pub fn select_task(&self) -> Option<TaskId> {
        let mut best: Option<&Task> = None;
        for task in self.tasks.iter() {
            if !self.is_ready(task) || !self.ledger.fits(&task.resources) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    task.priority > current.priority
                        || (task.priority == current.priority
                            && task.sequence < current.sequence)
                }
            };
            if better {
                best = Some(task);
            }
        }
        best.map(|task| task.id.clone())
    }

    /// Hand a task to a worker: mark it RUNNING, link it into the worker's
    /// assigned set, and take its resources from the ledger.
    pub fn assign(&mut self, task_id: &TaskId, worker_id: &WorkerId, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
            task.assigned_worker = Some(worker_id.clone());
            task.touch(now);
            self.ledger.acquire(&task.resources);
        }
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.assigned.insert(task_id.clone());
        }
    }

    /// Move a task to `new_status`, clearing any worker assignment on both
    /// sides and returning held resources to the ledger. Safe to call on a
    /// task in any status; only a RUNNING task actually holds resources.
    pub fn release(
        &mut self,
        task_id: &TaskId,
        new_status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Option<&mut Task> {
        let task = self.tasks.get_mut(task_id)?;
        if task.status == TaskStatus::Running {
            self.ledger.release(&task.resources);
        }
        if let Some(worker_id) = task.assigned_worker.take() {
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.assigned.remove(task_id);
            }
        }
        task.status = new_status;
        task.touch(now);
        Some(task)
    }

    /// Recompute everything derived from the owned registries: worker
    /// assigned sets, the resource ledger, and repair of RUNNING tasks whose
    /// worker did not survive. Called after a snapshot load. Returns the
    /// repaired tasks with the worker each one lost, so the caller can record
    /// the forced transitions.
    pub fn rebuild_derived(&mut self, now: DateTime<Utc>) -> Vec<(TaskId, Option<WorkerId>)> {
        for worker in self.workers.iter_mut() {
            worker.assigned.clear();
        }

        // Stakeholder sets may name workers the snapshot does not carry.
        let live: BTreeSet<WorkerId> =
            self.workers.iter().map(|worker| worker.id.clone()).collect();
        for task in self.tasks.iter_mut() {
            task.stakeholders.retain(|worker_id| live.contains(worker_id));
        }

        let mut orphaned = Vec::new();
        let mut links = Vec::new();
        for task in self.tasks.iter() {
            if task.status != TaskStatus::Running {
                continue;
            }
            match &task.assigned_worker {
                Some(worker_id) if self.workers.contains(worker_id) => {
                    links.push((worker_id.clone(), task.id.clone()));
                }
                lost => orphaned.push((task.id.clone(), lost.clone())),
            }
        }

        for (task_id, _) in &orphaned {
            warn!(task_id = %task_id, "running task has no surviving worker; back to pending");
            if let Some(task) = self.tasks.get_mut(task_id) {
                task.status = TaskStatus::Pending;
                task.assigned_worker = None;
                task.touch(now);
            }
        }
        for (worker_id, task_id) in links {
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.assigned.insert(task_id);
            }
        }

        self.ledger.recompute(
            self.tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Running)
                .map(|task| &task.resources),
        );
        orphaned
    }

    /// Check the cross-registry invariants: RUNNING tasks and worker
    /// assigned sets mirror each other exactly, stakeholders name only live
    /// workers, and the ledger equals the sum of RUNNING demands. Returns the
    /// first violation found.
    pub fn verify_consistency(&self) -> Result<(), String> {
        for task in self.tasks.iter() {
            for stakeholder in &task.stakeholders {
                if !self.workers.contains(stakeholder) {
                    return Err(format!(
                        "task '{}' lists departed stakeholder '{}'",
                        task.id, stakeholder
                    ));
                }
            }
            match (task.status, &task.assigned_worker) {
                (TaskStatus::Running, Some(worker_id)) => {
                    let Some(worker) = self.workers.get(worker_id) else {
                        return Err(format!(
                            "task '{}' is assigned to unknown worker '{}'",
                            task.id, worker_id
                        ));
                    };
                    if !worker.assigned.contains(&task.id) {
                        return Err(format!(
                            "worker '{}' does not list its running task '{}'",
                            worker_id, task.id
                        ));
                    }
                }
                (TaskStatus::Running, None) => {
                    return Err(format!("task '{}' is RUNNING with no assigned worker", task.id));
                }
                (status, Some(worker_id)) => {
                    return Err(format!(
                        "task '{}' is {} but still assigned to worker '{}'",
                        task.id, status, worker_id
                    ));
                }
                (_, None) => {}
            }
        }

        for worker in self.workers.iter() {
            for task_id in &worker.assigned {
                let running_here = self.tasks.get(task_id).is_some_and(|task| {
                    task.status == TaskStatus::Running
                        && task.assigned_worker.as_ref() == Some(&worker.id)
                });
                if !running_here {
                    return Err(format!(
                        "worker '{}' lists task '{}' it is not running",
                        worker.id, task_id
                    ));
                }
            }
        }

        let mut expected = ResourceLedger::new(self.ledger.capacities().clone());
        expected.recompute(
            self.tasks
                .iter()
                .filter(|task| task.status == TaskStatus::Running)
                .map(|task| &task.resources),
        );
        if expected.usage() != self.ledger.usage() {
            return Err(format!(
                "resource ledger desync: in use {:?}, running tasks demand {:?}",
                self.ledger.usage(),
                expected.usage()
            ));
        }
        Ok(())
    }
}
