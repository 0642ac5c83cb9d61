//! Dependency graph over expanded test units.
//!
//! Targets resolve to every data variant of a method, or to every unit of a
//! class. Edges point from a dependent to its dependencies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::errors::DiscoveryError;
use crate::types::*;

/// One resolved dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub target: usize,
    pub proceed_on_failure: bool,
}

/// Whether a unit may be dispatched given its dependencies' outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// A dependency has not finished yet.
    Waiting,
    Ready,
    /// A dependency did not pass and the edge does not proceed on failure.
    Blocked(String),
}

#[derive(Debug)]
pub struct DependencyGraph {
    units: Vec<Arc<TestUnit>>,
    index: HashMap<UnitId, usize>,
    direct: Vec<Vec<Edge>>,
    closure: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Resolve every declared dependency, rejecting duplicates, unknown
    /// targets and cycles.
    pub fn build(units: Vec<Arc<TestUnit>>) -> Result<Self, DiscoveryError> {
        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.id.clone(), i).is_some() {
                return Err(DiscoveryError::DuplicateUnit {
                    id: unit.id.to_string(),
                });
            }
        }

        let mut by_method: HashMap<(&str, &str), Vec<usize>> = HashMap::new();
        let mut by_class: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, unit) in units.iter().enumerate() {
            by_method
                .entry((unit.class_name(), unit.method.as_str()))
                .or_default()
                .push(i);
            by_class.entry(unit.class_name()).or_default().push(i);
        }

        let mut direct = Vec::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            let mut edges: Vec<Edge> = Vec::new();
            for dep in &unit.dependencies {
                let matched: Vec<usize> = match &dep.target {
                    DependencyTarget::Test { class, method } => {
                        let class = class.as_deref().unwrap_or(unit.class_name());
                        by_method
                            .get(&(class, method.as_str()))
                            .cloned()
                            .unwrap_or_default()
                    }
                    DependencyTarget::Class(class) => by_class
                        .get(class.as_str())
                        .map(|all| all.iter().copied().filter(|j| *j != i).collect())
                        .unwrap_or_default(),
                };
                if matched.is_empty() {
                    return Err(DiscoveryError::UnknownDependency {
                        test: unit.id.to_string(),
                        target: dep.target.to_string(),
                    });
                }
                for target in matched {
                    match edges.iter_mut().find(|e| e.target == target) {
                        // Any strict declaration wins.
                        Some(existing) => {
                            existing.proceed_on_failure &= dep.proceed_on_failure
                        }
                        None => edges.push(Edge {
                            target,
                            proceed_on_failure: dep.proceed_on_failure,
                        }),
                    }
                }
            }
            direct.push(edges);
        }

        if let Some(cycle) = find_cycle(&direct) {
            return Err(DiscoveryError::DependencyCycle {
                cycle: cycle.into_iter().map(|i| units[i].id.to_string()).collect(),
            });
        }

        let closure = (0..units.len()).map(|i| transitive(&direct, i)).collect();
        let mut dependents = vec![Vec::new(); units.len()];
        for (i, edges) in direct.iter().enumerate() {
            for edge in edges {
                dependents[edge.target].push(i);
            }
        }

        Ok(Self {
            units,
            index,
            direct,
            closure,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[Arc<TestUnit>] {
        &self.units
    }

    pub fn unit(&self, i: usize) -> &Arc<TestUnit> {
        &self.units[i]
    }

    pub fn index_of(&self, id: &UnitId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn direct(&self, i: usize) -> &[Edge] {
        &self.direct[i]
    }

    /// Every dependency reachable from `i`, each once, nearest first.
    pub fn closure(&self, i: usize) -> &[usize] {
        &self.closure[i]
    }

    /// Units that declare `i` as a direct dependency.
    pub fn dependents(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Statically skipped units are ready immediately; they record their
    /// skip without waiting on anything.
    pub fn readiness(&self, i: usize, outcomes: &[Option<Outcome>]) -> Readiness {
        if self.units[i].skip.is_some() {
            return Readiness::Ready;
        }
        let mut waiting = false;
        for edge in &self.direct[i] {
            match &outcomes[edge.target] {
                None => waiting = true,
                Some(outcome) if outcome.is_passed() || edge.proceed_on_failure => {}
                Some(outcome) => {
                    return Readiness::Blocked(format!(
                        "dependency {} {}",
                        self.units[edge.target].id,
                        outcome.label()
                    ));
                }
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Records for the unit context: the full closure, each once.
    pub fn dependency_records(
        &self,
        i: usize,
        outcomes: &[Option<Outcome>],
    ) -> Vec<DependencyRecord> {
        self.closure[i]
            .iter()
            .map(|&j| {
                let unit = &self.units[j];
                DependencyRecord {
                    unit_id: unit.id.clone(),
                    class: unit.class_name().to_string(),
                    method: unit.method.clone(),
                    display_name: unit.display_name.clone(),
                    outcome: outcomes.get(j).cloned().flatten(),
                    direct: self.direct[i].iter().any(|e| e.target == j),
                }
            })
            .collect()
    }

    /// A unit may not depend, directly or transitively, on a unit that
    /// holds a shared key with a higher order.
    pub fn check_order_conflicts(&self) -> Result<(), DiscoveryError> {
        for (i, unit) in self.units.iter().enumerate() {
            for key in unit.constraint_keys.iter() {
                let Some(order) = key.order else { continue };
                for &j in &self.closure[i] {
                    let dependency = &self.units[j];
                    let Some(dependency_order) = dependency.key_order(&key.name) else {
                        continue;
                    };
                    if order < dependency_order {
                        return Err(DiscoveryError::OrderConflict {
                            key: key.name.clone(),
                            dependent: unit.id.to_string(),
                            dependent_order: order,
                            dependency: dependency.id.to_string(),
                            dependency_order,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Indices of the units `select` accepts plus everything they depend
    /// on, in plan order.
    pub fn select_with_dependencies(&self, select: impl Fn(&TestUnit) -> bool) -> Vec<usize> {
        let mut keep = vec![false; self.units.len()];
        for (i, unit) in self.units.iter().enumerate() {
            if select(unit) {
                keep[i] = true;
                for &j in &self.closure[i] {
                    keep[j] = true;
                }
            }
        }
        keep.iter()
            .enumerate()
            .filter_map(|(i, k)| k.then_some(i))
            .collect()
    }

    /// Rebuild the graph over `keep`, which must be closed under
    /// dependencies.
    pub fn retain(self, keep: &[usize]) -> Result<Self, DiscoveryError> {
        let units = keep.iter().map(|&i| Arc::clone(&self.units[i])).collect();
        Self::build(units)
    }

    /// Replace the static skip reason of unit `i`.
    pub(crate) fn set_skip(&mut self, i: usize, reason: Option<String>) {
        Arc::make_mut(&mut self.units[i]).skip = reason;
    }
}

/// Depth-first search over direct edges. Returns the first cycle found,
/// closed on its starting unit.
fn find_cycle(direct: &[Vec<Edge>]) -> Option<Vec<usize>> {
    let mut visited = vec![false; direct.len()];
    // Index of each unit on the current path.
    let mut on_path: Vec<Option<usize>> = vec![None; direct.len()];
    let mut path = Vec::new();
    // (unit, next edge to follow)
    let mut frames: Vec<(usize, usize)> = Vec::new();
    for start in 0..direct.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        on_path[start] = Some(0);
        path.push(start);
        frames.push((start, 0));
        while let Some(frame) = frames.last_mut() {
            let (node, next) = *frame;
            frame.1 += 1;
            let Some(edge) = direct[node].get(next) else {
                frames.pop();
                path.pop();
                on_path[node] = None;
                continue;
            };
            if let Some(pos) = on_path[edge.target] {
                let mut cycle = path[pos..].to_vec();
                cycle.push(edge.target);
                return Some(cycle);
            }
            if !visited[edge.target] {
                visited[edge.target] = true;
                on_path[edge.target] = Some(path.len());
                path.push(edge.target);
                frames.push((edge.target, 0));
            }
        }
    }
    None
}

fn transitive(direct: &[Vec<Edge>], start: usize) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<usize> = direct[start].iter().map(|e| e.target).collect();
    while let Some(next) = queue.pop_front() {
        if next == start || !seen.insert(next) {
            continue;
        }
        order.push(next);
        queue.extend(direct[next].iter().map(|e| e.target));
    }
    order
}
