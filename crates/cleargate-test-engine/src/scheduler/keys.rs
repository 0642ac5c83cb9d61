//! Constraint-key table: mutual exclusion plus explicit start order.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::ConstraintKey;

/// Which keys are held by running units, and which explicit orders are
/// still waiting to start on each key.
#[derive(Debug, Default)]
pub struct KeyTable {
    held: HashSet<String>,
    /// Outstanding orders per key, as a multiset.
    pending: HashMap<String, BTreeMap<i32, usize>>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a unit that will start on `keys` at some point.
    pub fn register(&mut self, keys: &[ConstraintKey]) {
        for key in keys {
            if let Some(order) = key.order {
                *self
                    .pending
                    .entry(key.name.clone())
                    .or_default()
                    .entry(order)
                    .or_insert(0) += 1;
            }
        }
    }

    /// Lowest order still waiting to start on `key`.
    pub fn lowest_pending(&self, key: &str) -> Option<i32> {
        self.pending
            .get(key)
            .and_then(|orders| orders.keys().next().copied())
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    /// All keys are free, and every ordered key is at the front of its
    /// queue.
    pub fn can_acquire(&self, keys: &[ConstraintKey]) -> bool {
        keys.iter().all(|key| {
            !self.held.contains(&key.name)
                && key.order.is_none_or(|order| {
                    self.lowest_pending(&key.name)
                        .is_none_or(|lowest| order <= lowest)
                })
        })
    }

    /// Take every key at once, or none.
    pub fn acquire(&mut self, keys: &[ConstraintKey]) -> bool {
        if !self.can_acquire(keys) {
            return false;
        }
        for key in keys {
            self.held.insert(key.name.clone());
        }
        self.forfeit(keys);
        true
    }

    pub fn release(&mut self, keys: &[ConstraintKey]) {
        for key in keys {
            self.held.remove(&key.name);
        }
    }

    /// Drop a unit's outstanding orders without it ever holding the keys.
    pub fn forfeit(&mut self, keys: &[ConstraintKey]) {
        for key in keys {
            let Some(order) = key.order else { continue };
            let Some(orders) = self.pending.get_mut(&key.name) else {
                continue;
            };
            if let Some(count) = orders.get_mut(&order) {
                *count -= 1;
                if *count == 0 {
                    orders.remove(&order);
                }
            }
            if orders.is_empty() {
                self.pending.remove(&key.name);
            }
        }
    }
}
