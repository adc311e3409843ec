//! Resource accounting.

use std::collections::BTreeMap;

/// Tracks configured capacity against units held by RUNNING tasks.
///
/// The ledger is derived state: it is rebuilt from the set of RUNNING tasks
/// on load and kept in step by the assignment/release paths. It is never
/// persisted on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLedger {
    capacity: BTreeMap<String, u64>,
    in_use: BTreeMap<String, u64>,
}

impl ResourceLedger {
    /// Create a ledger with the given configured capacities.
    pub fn new(capacity: BTreeMap<String, u64>) -> Self {
        Self {
            capacity,
            in_use: BTreeMap::new(),
        }
    }

    /// Configured capacity for a resource. Unconfigured names default to 1,
    /// so a misspelled or not-yet-configured resource throttles to serial
    /// execution instead of admitting unbounded concurrency.
    pub fn capacity_of(&self, name: &str) -> u64 {
        self.capacity.get(name).copied().unwrap_or(1)
    }

    /// Units currently held for a resource.
    pub fn in_use_of(&self, name: &str) -> u64 {
        self.in_use.get(name).copied().unwrap_or(0)
    }

    /// True if the demand fits in the remaining capacity of every named
    /// resource. An empty demand always fits.
    pub fn fits(&self, demand: &BTreeMap<String, u64>) -> bool {
        demand
            .iter()
            .all(|(name, amount)| self.in_use_of(name) + amount <= self.capacity_of(name))
    }

    /// Take units for a task entering RUNNING.
    pub fn acquire(&mut self, demand: &BTreeMap<String, u64>) {
        for (name, amount) in demand {
            *self.in_use.entry(name.clone()).or_insert(0) += amount;
        }
    }

    /// Return units for a task leaving RUNNING. Saturating, so releasing
    /// more than is held cannot underflow.
    pub fn release(&mut self, demand: &BTreeMap<String, u64>) {
        for (name, amount) in demand {
            if let Some(held) = self.in_use.get_mut(name) {
                *held = held.saturating_sub(*amount);
                if *held == 0 {
                    self.in_use.remove(name);
                }
            }
        }
    }

    /// Rebuild the in-use map from scratch, summing the demands of all
    /// currently RUNNING tasks.
    pub fn recompute<'a, I>(&mut self, running_demands: I)
    where
        I: IntoIterator<Item = &'a BTreeMap<String, u64>>,
    {
        self.in_use.clear();
        for demand in running_demands {
            self.acquire(demand);
        }
    }

    /// Configured capacities, for introspection.
    pub fn capacities(&self) -> &BTreeMap<String, u64> {
        &self.capacity
    }

    /// Current usage, for introspection.
    pub fn usage(&self) -> &BTreeMap<String, u64> {
        &self.in_use
    }
}
