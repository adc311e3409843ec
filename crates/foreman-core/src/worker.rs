//! Worker entity.

use crate::{TaskId, WorkerId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A worker process known to the coordinator.
///
/// Workers are upserted by any RPC that names them; the coordinator only
/// tracks liveness and current assignments, never capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker identifier, chosen by the worker process.
    pub id: WorkerId,

    /// First time this worker contacted the coordinator.
    pub first_seen: DateTime<Utc>,

    /// Most recent contact. Drives the disconnect timeout.
    pub last_seen: DateTime<Utc>,

    /// Tasks currently assigned to this worker.
    ///
    /// Not persisted; rebuilt from tasks' `assigned_worker` on load so the
    /// bidirectional link can never disagree with the task side.
    #[serde(skip)]
    pub assigned: BTreeSet<TaskId>,

    /// Self-reported attributes (hostname and the like).
    #[serde(default)]
    pub info: BTreeMap<String, String>,
}

impl Worker {
    /// Register a worker first seen at the given instant.
    pub fn new(id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            first_seen: now,
            last_seen: now,
            assigned: BTreeSet::new(),
            info: BTreeMap::new(),
        }
    }

    /// Refresh the liveness stamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    /// Record a self-reported attribute.
    pub fn set_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.insert(key.into(), value.into());
    }

    /// True once the worker has been silent longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen > timeout
    }
}
