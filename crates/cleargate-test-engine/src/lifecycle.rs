//! Shared-instance lifecycle: single-flight creation, reference counting and
//! exactly-once disposal.
//!
//! Every consumer of a fixture is announced with [`FixtureManager::expect`]
//! while the plan is built. Announcing an owner also announces its nested
//! fixtures, once per distinct owner key. A consumer then either
//! [`acquire`](FixtureManager::acquire)s and later
//! [`release`](FixtureManager::release)s the instance, or
//! [`forfeit`](FixtureManager::forfeit)s it when it never runs. An instance
//! is disposed once nobody holds it and nobody is still expected to,
//! except session and global instances, which live until
//! [`shutdown`](FixtureManager::shutdown).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::errors::FixtureError;
use crate::traits::Fixture;
use crate::types::{FixtureRequest, SharingScope};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// One consumer slot (a unit argument, or a nested slot of an owner).
    Consumer(String),
    Class(String),
    Key(String),
    Assembly(String),
    Session,
    Global,
}

/// Sharing key: producer identity plus resolved scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixtureKey {
    pub factory: String,
    pub scope: ScopeKey,
}

/// Who is asking for a fixture.
#[derive(Debug, Clone)]
pub struct Consumer {
    /// Unique slot id, used for unshared instances.
    pub slot: String,
    pub class: String,
    pub assembly: String,
}

impl FixtureKey {
    /// The factory's name, not its identity, is the producer half of the
    /// key.
    pub fn resolve(request: &FixtureRequest, consumer: &Consumer) -> Self {
        let scope = match &request.scope {
            SharingScope::None => ScopeKey::Consumer(consumer.slot.clone()),
            SharingScope::PerTestClass => ScopeKey::Class(consumer.class.clone()),
            SharingScope::PerKey(k) => ScopeKey::Key(k.clone()),
            SharingScope::PerAssembly => ScopeKey::Assembly(consumer.assembly.clone()),
            SharingScope::PerTestSession => ScopeKey::Session,
            SharingScope::Global => ScopeKey::Global,
        };
        Self {
            factory: request.factory.name().to_string(),
            scope,
        }
    }

    /// Key of the `index`th nested fixture of the instance at `self`.
    fn nested(&self, index: usize, request: &FixtureRequest, owner: &Consumer) -> (Self, Consumer) {
        let consumer = Consumer {
            slot: format!("{self}>{index}"),
            class: owner.class.clone(),
            assembly: owner.assembly.clone(),
        };
        (Self::resolve(request, &consumer), consumer)
    }

    fn persistent(&self) -> bool {
        matches!(self.scope, ScopeKey::Session | ScopeKey::Global)
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ScopeKey::Consumer(slot) => write!(f, "{}@{slot}", self.factory),
            ScopeKey::Class(c) => write!(f, "{}@class:{c}", self.factory),
            ScopeKey::Key(k) => write!(f, "{}@key:{k}", self.factory),
            ScopeKey::Assembly(a) => write!(f, "{}@assembly:{a}", self.factory),
            ScopeKey::Session => write!(f, "{}@session", self.factory),
            ScopeKey::Global => write!(f, "{}@global", self.factory),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counts {
    pending: usize,
    active: usize,
    disposed: bool,
}

struct FixtureEntry {
    key: FixtureKey,
    counts: Mutex<Counts>,
    cell: OnceCell<Result<Arc<dyn Fixture>, FixtureError>>,
    nested: Mutex<Vec<FixtureKey>>,
    /// Nested keys announced at planning and not yet claimed by a build.
    expected_nested: Mutex<Vec<FixtureKey>>,
    /// Initialization order; owners always initialize after their nested
    /// fixtures.
    init_seq: AtomicU64,
}

impl FixtureEntry {
    fn new(key: FixtureKey) -> Self {
        Self {
            key,
            counts: Mutex::new(Counts::default()),
            cell: OnceCell::new(),
            nested: Mutex::new(Vec::new()),
            expected_nested: Mutex::new(Vec::new()),
            init_seq: AtomicU64::new(0),
        }
    }

    fn instance(&self) -> Option<Arc<dyn Fixture>> {
        match self.cell.get() {
            Some(Ok(instance)) => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    /// Mark disposed if nobody holds or expects the instance. Returns
    /// whether the caller is now responsible for disposal.
    fn claim_disposal(&self, force: bool) -> bool {
        let mut counts = self.counts.lock();
        if counts.disposed {
            return false;
        }
        let busy = counts.active > 0 || counts.pending > 0 || self.key.persistent();
        if busy && !force {
            return false;
        }
        counts.disposed = true;
        true
    }
}

/// Counters for created and disposed instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixtureStats {
    pub created: usize,
    pub disposed: usize,
    pub live: usize,
}

// ---------------------------------------------------------------------------
// FixtureManager
// ---------------------------------------------------------------------------

/// The single owner of cross-unit shared state.
#[derive(Default)]
pub struct FixtureManager {
    entries: Mutex<HashMap<FixtureKey, Arc<FixtureEntry>>>,
    init_counter: AtomicU64,
    created: AtomicUsize,
    disposed: AtomicUsize,
}

impl FixtureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FixtureStats {
        FixtureStats {
            created: self.created.load(Ordering::SeqCst),
            disposed: self.disposed.load(Ordering::SeqCst),
            live: self.entries.lock().len(),
        }
    }

    /// Announce a future consumer of `key`.
    pub fn expect(&self, key: &FixtureKey) {
        let entry = self.entry(key);
        entry.counts.lock().pending += 1;
    }

    /// Announce a future consumer of `key` built from `request`, along with
    /// the nested fixtures its construction will acquire.
    pub fn expect_request(&self, key: &FixtureKey, request: &FixtureRequest, consumer: &Consumer) {
        self.expect_tree(key, request, consumer, &mut Vec::new());
    }

    fn expect_tree(
        &self,
        key: &FixtureKey,
        request: &FixtureRequest,
        consumer: &Consumer,
        chain: &mut Vec<String>,
    ) {
        let entry = self.entry(key);
        let first = {
            let mut counts = entry.counts.lock();
            counts.pending += 1;
            counts.pending == 1 && counts.active == 0 && entry.cell.get().is_none()
        };
        let name = request.factory.name().to_string();
        // A cycle is reported when the owner is acquired.
        if !first || chain.contains(&name) {
            return;
        }
        chain.push(name);
        let mut expected = Vec::new();
        for (i, nested) in request.factory.nested().iter().enumerate() {
            let (nested_key, nested_consumer) = key.nested(i, nested, consumer);
            self.expect_tree(&nested_key, nested, &nested_consumer, chain);
            expected.push(nested_key);
        }
        chain.pop();
        *entry.expected_nested.lock() = expected;
    }

    /// Get or create the instance for `key`. The boolean is true for the one
    /// caller that constructed it.
    pub async fn acquire(
        &self,
        key: &FixtureKey,
        request: &FixtureRequest,
        consumer: &Consumer,
    ) -> Result<(Arc<dyn Fixture>, bool), FixtureError> {
        self.acquire_inner(key.clone(), request.clone(), consumer.clone(), Vec::new())
            .await
    }

    /// Drop one hold on `key`, disposing the instance if it was the last.
    pub fn release<'a>(&'a self, key: &FixtureKey) -> BoxFuture<'a, ()> {
        let entry = self.entries.lock().get(key).cloned();
        async move {
            let Some(entry) = entry else { return };
            {
                let mut counts = entry.counts.lock();
                counts.active = counts.active.saturating_sub(1);
            }
            if entry.claim_disposal(false) {
                self.dispose_entry(entry).await;
            }
        }
        .boxed()
    }

    /// Withdraw an expected consumer that will never acquire.
    pub async fn forfeit(&self, key: &FixtureKey) {
        let Some(entry) = self.entries.lock().get(key).cloned() else {
            return;
        };
        {
            let mut counts = entry.counts.lock();
            counts.pending = counts.pending.saturating_sub(1);
        }
        if entry.claim_disposal(false) {
            self.dispose_entry(entry).await;
        }
    }

    /// Dispose everything still alive, most recently initialized first.
    pub async fn shutdown(&self) {
        let mut remaining: Vec<Arc<FixtureEntry>> = self.entries.lock().values().cloned().collect();
        remaining.sort_by_key(|e| std::cmp::Reverse(e.init_seq.load(Ordering::SeqCst)));
        for entry in remaining {
            if entry.claim_disposal(true) {
                self.dispose_entry(entry).await;
            }
        }
        self.entries.lock().clear();
    }

    fn entry(&self, key: &FixtureKey) -> Arc<FixtureEntry> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            if !existing.counts.lock().disposed {
                return Arc::clone(existing);
            }
        }
        let entry = Arc::new(FixtureEntry::new(key.clone()));
        entries.insert(key.clone(), Arc::clone(&entry));
        entry
    }

    fn acquire_inner(
        &self,
        key: FixtureKey,
        request: FixtureRequest,
        consumer: Consumer,
        chain: Vec<String>,
    ) -> BoxFuture<'_, Result<(Arc<dyn Fixture>, bool), FixtureError>> {
        async move {
            let name = request.factory.name().to_string();
            if chain.contains(&name) {
                let mut chain = chain;
                chain.push(name);
                return Err(FixtureError::NestedCycle { chain });
            }

            let entry = self.entry(&key);
            {
                let mut counts = entry.counts.lock();
                counts.pending = counts.pending.saturating_sub(1);
                counts.active += 1;
            }

            let created = AtomicBool::new(false);
            let created_flag = &created;
            let build = self.build(&entry, &request, &consumer, chain);
            let result = entry
                .cell
                .get_or_init(|| async move {
                    created_flag.store(true, Ordering::SeqCst);
                    build.await
                })
                .await
                .clone();

            match result {
                Ok(instance) => Ok((instance, created.load(Ordering::SeqCst))),
                Err(e) => {
                    entry.counts.lock().active -= 1;
                    Err(e)
                }
            }
        }
        .boxed()
    }

    async fn build(
        &self,
        entry: &FixtureEntry,
        request: &FixtureRequest,
        consumer: &Consumer,
        mut chain: Vec<String>,
    ) -> Result<Arc<dyn Fixture>, FixtureError> {
        let factory = &request.factory;
        chain.push(factory.name().to_string());

        let mut unclaimed = std::mem::take(&mut *entry.expected_nested.lock());
        let mut nested_keys = Vec::new();
        let mut nested_instances = Vec::new();
        for (i, nested) in factory.nested().into_iter().enumerate() {
            let (nested_key, nested_consumer) = entry.key.nested(i, &nested, consumer);
            unclaimed.retain(|k| *k != nested_key);
            match self
                .acquire_inner(nested_key.clone(), nested, nested_consumer, chain.clone())
                .await
            {
                Ok((instance, _)) => {
                    nested_keys.push(nested_key);
                    nested_instances.push(instance);
                }
                Err(e) => {
                    for key in nested_keys.iter().rev() {
                        self.release(key).await;
                    }
                    self.forfeit_all(unclaimed).await;
                    return Err(e);
                }
            }
        }
        *entry.nested.lock() = nested_keys;

        tracing::debug!(fixture = %entry.key, "creating fixture");
        let built = async {
            let instance =
                factory
                    .create(nested_instances)
                    .await
                    .map_err(|e| FixtureError::Create {
                        factory: factory.name().to_string(),
                        message: e.to_string(),
                    })?;
            self.created.fetch_add(1, Ordering::SeqCst);
            instance
                .initialize()
                .await
                .map_err(|e| FixtureError::Initialize {
                    factory: factory.name().to_string(),
                    message: e.to_string(),
                })?;
            Ok::<_, FixtureError>(instance)
        }
        .await;

        match built {
            Ok(instance) => {
                entry.init_seq.store(
                    self.init_counter.fetch_add(1, Ordering::SeqCst) + 1,
                    Ordering::SeqCst,
                );
                Ok(instance)
            }
            Err(e) => {
                let nested = std::mem::take(&mut *entry.nested.lock());
                for key in nested.iter().rev() {
                    self.release(key).await;
                }
                Err(e)
            }
        }
    }

    async fn dispose_entry(&self, entry: Arc<FixtureEntry>) {
        {
            let mut entries = self.entries.lock();
            if entries
                .get(&entry.key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                entries.remove(&entry.key);
            }
        }
        if let Some(instance) = entry.instance() {
            tracing::debug!(fixture = %entry.key, "disposing fixture");
            instance.dispose();
            instance.dispose_async().await;
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
        let nested = std::mem::take(&mut *entry.nested.lock());
        for key in nested.iter().rev() {
            self.release(key).await;
        }
        let expected = std::mem::take(&mut *entry.expected_nested.lock());
        self.forfeit_all(expected).await;
    }

    fn forfeit_all(&self, keys: Vec<FixtureKey>) -> BoxFuture<'_, ()> {
        async move {
            for key in keys.iter().rev() {
                self.forfeit(key).await;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{Recorder, RecordingFactory, RecordingFixture};

    fn consumer(slot: &str) -> Consumer {
        Consumer {
            slot: slot.to_string(),
            class: "Class".to_string(),
            assembly: "asm".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_acquirers_share_one_instance() {
        let recorder = Recorder::default();
        let factory = RecordingFactory::new("db", recorder.clone()).with_delay(Duration::from_millis(20));
        let request = FixtureRequest::new(factory, SharingScope::PerKey("shared".into()));
        let manager = Arc::new(FixtureManager::new());
        let key = FixtureKey::resolve(&request, &consumer("a"));
        for _ in 0..32 {
            manager.expect(&key);
        }

        let mut tasks = Vec::new();
        for i in 0..32 {
            let manager = manager.clone();
            let request = request.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .acquire(&key, &request, &consumer(&format!("c{i}")))
                    .await
                    .unwrap()
            }));
        }
        let mut creators = 0;
        let mut first: Option<Arc<dyn Fixture>> = None;
        for t in tasks {
            let (instance, created) = t.await.unwrap();
            if created {
                creators += 1;
            }
            if let Some(f) = &first {
                assert!(Arc::ptr_eq(f, &instance));
            }
            first = Some(instance);
        }
        assert_eq!(creators, 1);
        assert_eq!(recorder.count("create:db"), 1);
        assert_eq!(recorder.count("init:db"), 1);

        for _ in 0..31 {
            manager.release(&key).await;
        }
        assert_eq!(recorder.count("dispose:db"), 0);
        manager.release(&key).await;
        assert_eq!(recorder.count("dispose:db"), 1);
        assert_eq!(recorder.count("dispose_async:db"), 1);
        assert_eq!(manager.stats().live, 0);
    }

    #[tokio::test]
    async fn unshared_scope_creates_per_consumer() {
        let recorder = Recorder::default();
        let request =
            FixtureRequest::new(RecordingFactory::new("svc", recorder.clone()), SharingScope::None);
        let manager = FixtureManager::new();
        for i in 0..3 {
            let c = consumer(&format!("unit{i}"));
            let key = FixtureKey::resolve(&request, &c);
            manager.expect(&key);
            let (_, created) = manager.acquire(&key, &request, &c).await.unwrap();
            assert!(created);
            manager.release(&key).await;
        }
        assert_eq!(recorder.count("create:svc"), 3);
        assert_eq!(recorder.count("dispose:svc"), 3);
    }

    #[tokio::test]
    async fn factory_name_is_the_sharing_identity() {
        let recorder = Recorder::default();
        let first = FixtureRequest::new(RecordingFactory::new("db", recorder.clone()), SharingScope::PerTestSession);
        let second = FixtureRequest::new(RecordingFactory::new("db", recorder.clone()), SharingScope::PerTestSession);
        let other = FixtureRequest::new(RecordingFactory::new("cache", recorder.clone()), SharingScope::PerTestSession);
        let a = FixtureKey::resolve(&first, &consumer("a"));
        let b = FixtureKey::resolve(&second, &consumer("b"));
        let c = FixtureKey::resolve(&other, &consumer("c"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let manager = FixtureManager::new();
        let (x, _) = manager.acquire(&a, &first, &consumer("a")).await.unwrap();
        let (y, created) = manager.acquire(&b, &second, &consumer("b")).await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&x, &y));
        assert_eq!(recorder.count("create:db"), 1);
    }

    #[tokio::test]
    async fn shared_nested_fixture_outlives_each_owner() {
        let recorder = Recorder::default();
        let outer = || {
            FixtureRequest::new(
                RecordingFactory::new("outer", recorder.clone()).with_nested(FixtureRequest::new(
                    RecordingFactory::new("inner", recorder.clone()),
                    SharingScope::PerKey("k".into()),
                )),
                SharingScope::None,
            )
        };
        let manager = FixtureManager::new();
        let (first, second) = (outer(), outer());
        let (c1, c2) = (consumer("u1"), consumer("u2"));
        let (k1, k2) = (FixtureKey::resolve(&first, &c1), FixtureKey::resolve(&second, &c2));
        manager.expect_request(&k1, &first, &c1);
        manager.expect_request(&k2, &second, &c2);

        manager.acquire(&k1, &first, &c1).await.unwrap();
        manager.release(&k1).await;
        assert_eq!(recorder.count("dispose:outer"), 1);
        assert_eq!(recorder.count("dispose:inner"), 0);

        manager.acquire(&k2, &second, &c2).await.unwrap();
        manager.release(&k2).await;
        assert_eq!(recorder.count("create:inner"), 1);
        assert_eq!(recorder.count("dispose:inner"), 1);
        assert_eq!(manager.stats().live, 0);
    }

    #[tokio::test]
    async fn forfeited_owner_withdraws_its_nested_expectations() {
        let recorder = Recorder::default();
        let request = FixtureRequest::new(
            RecordingFactory::new("outer", recorder.clone()).with_nested(FixtureRequest::new(
                RecordingFactory::new("inner", recorder.clone()),
                SharingScope::PerAssembly,
            )),
            SharingScope::PerTestClass,
        );
        let manager = FixtureManager::new();
        let c = consumer("u1");
        let key = FixtureKey::resolve(&request, &c);
        manager.expect_request(&key, &request, &c);
        manager.expect_request(&key, &request, &c);
        assert_eq!(manager.stats().live, 2);

        manager.forfeit(&key).await;
        manager.forfeit(&key).await;
        assert_eq!(manager.stats().live, 0);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn pending_consumers_delay_disposal() {
        let recorder = Recorder::default();
        let request = FixtureRequest::new(
            RecordingFactory::new("cls", recorder.clone()),
            SharingScope::PerTestClass,
        );
        let manager = FixtureManager::new();
        let key = FixtureKey::resolve(&request, &consumer("a"));
        manager.expect(&key);
        manager.expect(&key);

        manager.acquire(&key, &request, &consumer("a")).await.unwrap();
        manager.release(&key).await;
        assert_eq!(recorder.count("dispose:cls"), 0);

        manager.forfeit(&key).await;
        assert_eq!(recorder.count("dispose:cls"), 1);
    }

    #[tokio::test]
    async fn forfeit_without_creation_disposes_nothing() {
        let recorder = Recorder::default();
        let request = FixtureRequest::new(
            RecordingFactory::new("lazy", recorder.clone()),
            SharingScope::PerAssembly,
        );
        let manager = FixtureManager::new();
        let key = FixtureKey::resolve(&request, &consumer("a"));
        manager.expect(&key);
        manager.forfeit(&key).await;
        assert!(recorder.events().is_empty());
        assert_eq!(manager.stats().live, 0);
    }

    #[tokio::test]
    async fn session_instances_live_until_shutdown() {
        let recorder = Recorder::default();
        let request = FixtureRequest::new(
            RecordingFactory::new("server", recorder.clone()),
            SharingScope::PerTestSession,
        );
        let manager = FixtureManager::new();
        let key = FixtureKey::resolve(&request, &consumer("a"));
        manager.expect(&key);
        manager.acquire(&key, &request, &consumer("a")).await.unwrap();
        manager.release(&key).await;
        assert_eq!(recorder.count("dispose:server"), 0);

        manager.shutdown().await;
        assert_eq!(recorder.count("dispose:server"), 1);
        manager.shutdown().await;
        assert_eq!(recorder.count("dispose:server"), 1);
    }

    #[tokio::test]
    async fn nested_fixtures_initialize_deepest_first() {
        let recorder = Recorder::default();
        let inner = FixtureRequest::new(RecordingFactory::new("inner", recorder.clone()), SharingScope::None);
        let middle = FixtureRequest::new(
            RecordingFactory::new("middle", recorder.clone()).with_nested(inner),
            SharingScope::None,
        );
        let outer = FixtureRequest::new(
            RecordingFactory::new("outer", recorder.clone()).with_nested(middle),
            SharingScope::None,
        );
        let manager = FixtureManager::new();
        let c = consumer("unit");
        let key = FixtureKey::resolve(&outer, &c);
        manager.expect(&key);
        let (instance, _) = manager.acquire(&key, &outer, &c).await.unwrap();
        let outer_fixture = instance.downcast_ref::<RecordingFixture>().unwrap();
        assert_eq!(outer_fixture.nested.len(), 1);

        let inits: Vec<String> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("init:"))
            .collect();
        assert_eq!(inits, vec!["init:inner", "init:middle", "init:outer"]);

        manager.release(&key).await;
        let disposals: Vec<String> = recorder
            .events()
            .into_iter()
            .filter(|e| e.starts_with("dispose:"))
            .collect();
        assert_eq!(disposals, vec!["dispose:outer", "dispose:middle", "dispose:inner"]);
        assert_eq!(manager.stats().live, 0);
    }

    #[tokio::test]
    async fn nested_cycle_is_an_error() {
        let recorder = Recorder::default();
        let inner = FixtureRequest::new(RecordingFactory::new("loop", recorder.clone()), SharingScope::None);
        let outer = FixtureRequest::new(
            RecordingFactory::new("loop", recorder.clone()).with_nested(inner),
            SharingScope::None,
        );
        let manager = FixtureManager::new();
        let c = consumer("unit");
        let key = FixtureKey::resolve(&outer, &c);
        let err = manager.acquire(&key, &outer, &c).await.err().unwrap();
        assert!(matches!(err, FixtureError::NestedCycle { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_initialization_runs_once_and_fails_every_waiter() {
        let recorder = Recorder::default();
        let request = FixtureRequest::new(
            RecordingFactory::new("broken", recorder.clone())
                .with_delay(Duration::from_millis(10))
                .failing_init(),
            SharingScope::PerKey("k".into()),
        );
        let manager = Arc::new(FixtureManager::new());
        let key = FixtureKey::resolve(&request, &consumer("a"));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            let request = request.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .acquire(&key, &request, &consumer(&format!("c{i}")))
                    .await
                    .is_err()
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert_eq!(recorder.count("create:broken"), 1);
    }
}
