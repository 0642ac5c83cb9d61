//! Constraint-aware admission.
//!
//! The run loop hands the scheduler every unit whose dependencies are
//! settled; the scheduler decides which of them start now. Rules, in the
//! order they are checked:
//!
//! 1. Partition: only one parallel group (the ungrouped partition counts as
//!    one) has units in flight. Another partition starts once the active one
//!    has drained and has nothing left that is ready.
//! 2. Constraint keys, taken all at once; ordered keys start lowest first.
//! 3. Named limiters.
//! 4. The global ceiling, which the adaptive controller may move.
//!
//! Candidates are tried by priority (highest first), then lowest explicit
//! key order, then registration order. Units that will only record a skip
//! are "light": they respect the partition but bypass keys, limiters and
//! the ceiling, and give up their place in any ordered key queue.

mod adaptive;
mod keys;

use std::cmp::Reverse;
use std::collections::HashMap;

pub use adaptive::{AdaptiveCeiling, AdaptiveConfig};
pub(crate) use adaptive::spawn_controller;
pub use keys::KeyTable;

use crate::types::{ConstraintKey, Partition, TestUnit};

/// A unit the run loop would like to start.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub index: usize,
    pub unit: &'a TestUnit,
    /// The unit will not run its body.
    pub light: bool,
}

#[derive(Debug)]
struct Admitted {
    keys: Vec<ConstraintKey>,
    limit: Option<String>,
    partition: Partition,
    light: bool,
}

#[derive(Debug)]
pub struct Scheduler {
    keys: KeyTable,
    limits: HashMap<String, (usize, usize)>,
    admitted: HashMap<usize, Admitted>,
    partition: Option<Partition>,
    in_partition: usize,
    heavy: usize,
    ceiling: usize,
}

impl Scheduler {
    pub fn new<'a>(units: impl IntoIterator<Item = &'a TestUnit>, ceiling: usize) -> Self {
        let mut keys = KeyTable::new();
        let mut limits = HashMap::new();
        for unit in units {
            keys.register(&unit.constraint_keys);
            if let Some(limit) = &unit.limit {
                let entry = limits.entry(limit.name.clone()).or_insert((limit.limit, 0));
                // Declarations of one limiter may disagree; the tightest wins.
                entry.0 = entry.0.min(limit.limit);
            }
        }
        Self {
            keys,
            limits,
            admitted: HashMap::new(),
            partition: None,
            in_partition: 0,
            heavy: 0,
            ceiling: ceiling.max(1),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn set_ceiling(&mut self, ceiling: usize) {
        self.ceiling = ceiling.max(1);
    }

    /// Units in flight, light ones included.
    pub fn running(&self) -> usize {
        self.admitted.len()
    }

    pub fn active_partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    /// Admit what can start now, in dispatch order.
    pub fn admit(&mut self, candidates: &[Candidate<'_>]) -> Vec<usize> {
        let mut ordered: Vec<&Candidate<'_>> = candidates.iter().collect();
        ordered.sort_by_key(|c| {
            (
                Reverse(c.unit.priority),
                c.unit.min_key_order().map_or((1, 0), |o| (0, o)),
                c.unit.seq,
            )
        });

        let mut started = Vec::new();
        for candidate in ordered {
            let partition = candidate.unit.partition();
            if self
                .partition
                .as_ref()
                .is_some_and(|active| *active != partition)
            {
                continue;
            }
            if candidate.light {
                self.keys.forfeit(&candidate.unit.constraint_keys);
                self.record(candidate, partition);
                started.push(candidate.index);
                continue;
            }
            if self.heavy >= self.ceiling
                || !self.keys.can_acquire(&candidate.unit.constraint_keys)
                || !self.limit_open(candidate.unit)
            {
                continue;
            }
            self.keys.acquire(&candidate.unit.constraint_keys);
            if let Some(entry) = candidate
                .unit
                .limit
                .as_ref()
                .and_then(|limit| self.limits.get_mut(&limit.name))
            {
                entry.1 += 1;
            }
            self.heavy += 1;
            self.record(candidate, partition);
            started.push(candidate.index);
        }
        started
    }

    /// Release everything unit `index` holds.
    pub fn complete(&mut self, index: usize) {
        let Some(admitted) = self.admitted.remove(&index) else {
            return;
        };
        if !admitted.light {
            self.keys.release(&admitted.keys);
            if let Some(entry) = admitted
                .limit
                .as_ref()
                .and_then(|name| self.limits.get_mut(name))
            {
                entry.1 = entry.1.saturating_sub(1);
            }
            self.heavy -= 1;
        }
        if self.partition.as_ref() == Some(&admitted.partition) {
            self.in_partition -= 1;
            if self.in_partition == 0 {
                self.partition = None;
            }
        }
    }

    /// Forget a unit that finished without ever being admitted.
    pub fn forfeit(&mut self, unit: &TestUnit) {
        self.keys.forfeit(&unit.constraint_keys);
    }

    fn limit_open(&self, unit: &TestUnit) -> bool {
        match &unit.limit {
            Some(limit) => self
                .limits
                .get(&limit.name)
                .is_none_or(|(cap, active)| active < cap),
            None => true,
        }
    }

    fn record(&mut self, candidate: &Candidate<'_>, partition: Partition) {
        if self.partition.is_none() {
            self.partition = Some(partition.clone());
        }
        self.in_partition += 1;
        self.admitted.insert(
            candidate.index,
            Admitted {
                keys: candidate.unit.constraint_keys.clone(),
                limit: candidate.unit.limit.as_ref().map(|l| l.name.clone()),
                partition,
                light: candidate.light,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::bare_unit;
    use crate::types::{ParallelGroup, ParallelLimit, Priority};

    fn candidates(units: &[TestUnit]) -> Vec<Candidate<'_>> {
        units
            .iter()
            .enumerate()
            .map(|(index, unit)| Candidate {
                index,
                unit,
                light: false,
            })
            .collect()
    }

    #[test]
    fn ceiling_caps_admission() {
        let units: Vec<TestUnit> = (0..5).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        let mut s = Scheduler::new(&units, 2);
        assert_eq!(s.admit(&candidates(&units)), vec![0, 1]);
        s.complete(0);
        assert_eq!(s.admit(&candidates(&units)[2..]), vec![2]);
    }

    #[test]
    fn priority_orders_admission() {
        let mut units: Vec<TestUnit> = (0..4).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        units[0].priority = Priority::Low;
        units[3].priority = Priority::Critical;
        units[2].priority = Priority::High;
        let mut s = Scheduler::new(&units, 2);
        assert_eq!(s.admit(&candidates(&units)), vec![3, 2]);
    }

    #[test]
    fn shared_key_serializes() {
        let mut units: Vec<TestUnit> = (0..3).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        units[0].constraint_keys = vec![ConstraintKey::new("db")];
        units[1].constraint_keys = vec![ConstraintKey::new("db")];
        let mut s = Scheduler::new(&units, 8);
        assert_eq!(s.admit(&candidates(&units)), vec![0, 2]);
        s.complete(0);
        assert_eq!(s.admit(&candidates(&units)[1..2]), vec![1]);
    }

    #[test]
    fn ordered_keys_start_lowest_first() {
        let mut units: Vec<TestUnit> = (0..3).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        units[0].constraint_keys = vec![ConstraintKey::ordered("db", 3)];
        units[1].constraint_keys = vec![ConstraintKey::ordered("db", 1)];
        units[2].constraint_keys = vec![ConstraintKey::ordered("db", 2)];
        let mut s = Scheduler::new(&units, 8);

        // Only the order-3 unit is ready; it must wait for 1 and 2.
        assert!(s.admit(&candidates(&units)[0..1]).is_empty());
        assert_eq!(s.admit(&candidates(&units)), vec![1]);
        s.complete(1);
        assert_eq!(s.admit(&[candidates(&units)[0], candidates(&units)[2]]), vec![2]);
    }

    #[test]
    fn limiter_is_a_hard_cap() {
        let mut units: Vec<TestUnit> = (0..4).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        for unit in &mut units[..3] {
            unit.limit = Some(ParallelLimit::new("io", 1));
        }
        let mut s = Scheduler::new(&units, 8);
        assert_eq!(s.admit(&candidates(&units)), vec![0, 3]);
        s.complete(0);
        assert_eq!(s.admit(&candidates(&units)[1..3]), vec![1]);
    }

    #[test]
    fn one_partition_at_a_time() {
        let mut units: Vec<TestUnit> = (0..4).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        units[0].group = Some(ParallelGroup::new("a"));
        units[1].group = Some(ParallelGroup::new("a"));
        units[2].group = Some(ParallelGroup::new("b"));
        let mut s = Scheduler::new(&units, 8);

        assert_eq!(s.admit(&candidates(&units)), vec![0, 1]);
        assert!(s.admit(&candidates(&units)[2..]).is_empty());
        s.complete(0);
        assert!(s.admit(&candidates(&units)[2..]).is_empty());
        s.complete(1);
        assert_eq!(s.active_partition(), None);
        assert_eq!(s.admit(&candidates(&units)[2..]), vec![2]);
        assert_eq!(s.active_partition(), Some(&Partition::Group(ParallelGroup::new("b"))));
    }

    #[test]
    fn light_units_bypass_keys_and_ceiling() {
        let mut units: Vec<TestUnit> = (0..3).map(|i| bare_unit("T", &format!("t{i}"), i)).collect();
        units[0].constraint_keys = vec![ConstraintKey::ordered("db", 1)];
        units[1].constraint_keys = vec![ConstraintKey::ordered("db", 2)];
        let mut s = Scheduler::new(&units, 1);
        assert_eq!(s.admit(&candidates(&units)[2..]), vec![2]);

        let light = Candidate {
            index: 0,
            unit: &units[0],
            light: true,
        };
        assert_eq!(s.admit(&[light, candidates(&units)[1]]), vec![0]);
        s.complete(2);
        assert_eq!(s.admit(&candidates(&units)[1..2]), vec![1]);
    }
}
