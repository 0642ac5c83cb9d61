//! Class and assembly scope bookkeeping.
//!
//! A scope's Before batch runs once, started by the first unit of the scope
//! that gets to run; concurrent units of the same scope wait for it. The
//! After batch runs once, when the last unit counted at plan time leaves.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::OnceCell;

use crate::context::Ambient;
use crate::types::{HookScope, TestUnit};

/// Result of a scope's Before batch.
#[derive(Debug, Clone)]
pub(crate) struct ScopeEntry {
    /// Ambient nested scopes fork from.
    pub ambient: Ambient,
    /// Why contained units are skipped, if the Before batch failed.
    pub failure: Option<String>,
}

struct ScopeState {
    before: OnceCell<ScopeEntry>,
    remaining: AtomicUsize,
    finished: AtomicBool,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            before: OnceCell::new(),
            remaining: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// The Before batch started and nobody has claimed the After yet.
    fn claim_finish(&self) -> Option<&ScopeEntry> {
        let entry = self.before.get()?;
        if self.finished.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(entry)
    }
}

type ScopeId = (HookScope, String);

pub(crate) struct ScopeTracker {
    scopes: HashMap<ScopeId, ScopeState>,
}

impl ScopeTracker {
    /// Count every planned unit against its class and assembly.
    pub fn new<'a>(units: impl IntoIterator<Item = &'a TestUnit>) -> Self {
        let mut scopes: HashMap<ScopeId, ScopeState> = HashMap::new();
        for unit in units {
            for id in Self::ids(unit) {
                scopes
                    .entry(id)
                    .or_insert_with(ScopeState::new)
                    .remaining
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        Self { scopes }
    }

    fn ids(unit: &TestUnit) -> [ScopeId; 2] {
        [
            (HookScope::Assembly, unit.assembly().to_string()),
            (HookScope::Class, unit.class_name().to_string()),
        ]
    }

    /// Run `before` if this scope has not started yet, or wait for whoever
    /// is running it. `None` for scopes no planned unit belongs to.
    pub async fn enter<F, Fut>(&self, scope: HookScope, name: &str, before: F) -> Option<&ScopeEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScopeEntry>,
    {
        let state = self.scopes.get(&(scope, name.to_string()))?;
        Some(state.before.get_or_init(before).await)
    }

    /// Count one unit out of the scope. Returns the entry when this was the
    /// last unit and the scope's After batch is now the caller's to run.
    pub fn leave(&self, scope: HookScope, name: &str) -> Option<&ScopeEntry> {
        let state = self.scopes.get(&(scope, name.to_string()))?;
        let before = state.remaining.fetch_sub(1, Ordering::SeqCst);
        if before != 1 {
            return None;
        }
        state.claim_finish()
    }

    /// Scopes that started but will never see their last unit, as happens
    /// on cancellation or fail-fast. Classes come before assemblies.
    pub fn unfinished(&self) -> Vec<(HookScope, String, ScopeEntry)> {
        let mut open: Vec<(HookScope, String, ScopeEntry)> = self
            .scopes
            .iter()
            .filter_map(|((scope, name), state)| {
                state
                    .claim_finish()
                    .map(|entry| (*scope, name.clone(), entry.clone()))
            })
            .collect();
        open.sort_by_key(|(scope, name, _)| (*scope != HookScope::Class, name.clone()));
        open
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::bare_unit;

    fn entry() -> ScopeEntry {
        ScopeEntry {
            ambient: Ambient::new(),
            failure: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn before_runs_once_for_concurrent_units() {
        let units = vec![bare_unit("A", "a", 0), bare_unit("A", "b", 1), bare_unit("A", "c", 2)];
        let tracker = Arc::new(ScopeTracker::new(&units));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let tracker = tracker.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                tracker
                    .enter(HookScope::Class, "A", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        entry()
                    })
                    .await
                    .is_some()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_unit_out_finishes_the_scope() {
        let units = vec![bare_unit("A", "a", 0), bare_unit("A", "b", 1)];
        let tracker = ScopeTracker::new(&units);
        tracker.enter(HookScope::Class, "A", || async { entry() }).await;

        assert!(tracker.leave(HookScope::Class, "A").is_none());
        assert!(tracker.leave(HookScope::Class, "A").is_some());
        assert!(tracker.unfinished().is_empty());
    }

    #[tokio::test]
    async fn scope_that_never_started_has_no_after() {
        let units = vec![bare_unit("A", "a", 0)];
        let tracker = ScopeTracker::new(&units);
        assert!(tracker.leave(HookScope::Class, "A").is_none());
        assert!(tracker.leave(HookScope::Assembly, "default").is_none());
    }

    #[tokio::test]
    async fn abandoned_scopes_are_reported_classes_first() {
        let units = vec![bare_unit("A", "a", 0), bare_unit("A", "b", 1)];
        let tracker = ScopeTracker::new(&units);
        tracker.enter(HookScope::Assembly, "default", || async { entry() }).await;
        tracker.enter(HookScope::Class, "A", || async { entry() }).await;
        tracker.leave(HookScope::Class, "A");

        let open: Vec<(HookScope, String)> = tracker
            .unfinished()
            .into_iter()
            .map(|(scope, name, _)| (scope, name))
            .collect();
        assert_eq!(
            open,
            vec![
                (HookScope::Class, "A".to_string()),
                (HookScope::Assembly, "default".to_string())
            ]
        );
        assert!(tracker.unfinished().is_empty());
    }
}
