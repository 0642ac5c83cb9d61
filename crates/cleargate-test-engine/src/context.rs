//! Execution contexts handed to test bodies, hooks and receivers.
//!
//! Context is passed explicitly to every async call rather than kept in
//! thread-locals. Values that should flow into nested scopes are
//! [published](Ambient::publish) on the outer scope's [`Ambient`] and copied
//! into each child scope when it forks.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::traits::Fixture;
use crate::types::*;

// ---------------------------------------------------------------------------
// Ambient
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AmbientValues {
    published: BTreeMap<String, Value>,
    local: BTreeMap<String, Value>,
}

/// Scope-local values with explicit propagation.
///
/// Clones share storage. [`fork`](Self::fork) creates the child scope's
/// ambient, seeded with the values published so far.
#[derive(Clone, Default)]
pub struct Ambient {
    values: Arc<RwLock<AmbientValues>>,
}

impl Ambient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value visible here and in every scope forked afterwards.
    pub fn publish(&self, key: impl Into<String>, value: Value) {
        self.values.write().published.insert(key.into(), value);
    }

    /// Set a value visible only in this scope.
    pub fn set_local(&self, key: impl Into<String>, value: Value) {
        self.values.write().local.insert(key.into(), value);
    }

    /// Local values shadow published ones.
    pub fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read();
        values
            .local
            .get(key)
            .or_else(|| values.published.get(key))
            .cloned()
    }

    pub fn published(&self) -> BTreeMap<String, Value> {
        self.values.read().published.clone()
    }

    pub fn fork(&self) -> Ambient {
        let published = self.values.read().published.clone();
        Ambient {
            values: Arc::new(RwLock::new(AmbientValues {
                published,
                local: BTreeMap::new(),
            })),
        }
    }
}

impl std::fmt::Debug for Ambient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.values.read();
        f.debug_struct("Ambient")
            .field("published", &values.published)
            .field("local", &values.local)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StateBag
// ---------------------------------------------------------------------------

/// Free-form per-unit storage that survives across hook stages and retries.
#[derive(Clone, Default)]
pub struct StateBag {
    values: Arc<RwLock<HashMap<String, Value>>>,
    objects: Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl StateBag {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    /// Append to a JSON array stored under `key`, creating it if needed.
    pub fn push(&self, key: impl Into<String>, value: Value) {
        let mut values = self.values.write();
        let entry = values
            .entry(key.into())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value),
            other => *other = Value::Array(vec![other.take(), value]),
        }
    }

    pub fn set_object<T: Any + Send + Sync>(&self, key: impl Into<String>, object: T) {
        self.objects.write().insert(key.into(), Arc::new(object));
    }

    pub fn object<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let object = self.objects.read().get(key).cloned()?;
        object.downcast::<T>().ok()
    }
}

// ---------------------------------------------------------------------------
// ScopeInfo
// ---------------------------------------------------------------------------

/// What a hook, skip predicate or receiver is running for.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeInfo {
    pub scope: HookScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<UnitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ScopeInfo {
    pub fn session() -> Self {
        Self::bare(HookScope::TestSession)
    }

    pub fn discovery() -> Self {
        Self::bare(HookScope::TestDiscovery)
    }

    pub fn assembly(assembly: impl Into<String>) -> Self {
        Self {
            assembly: Some(assembly.into()),
            ..Self::bare(HookScope::Assembly)
        }
    }

    pub fn class(class: &ClassDescriptor) -> Self {
        Self {
            assembly: Some(class.assembly.clone()),
            class: Some(class.name.clone()),
            ..Self::bare(HookScope::Class)
        }
    }

    pub fn test(unit: &TestUnit) -> Self {
        Self {
            scope: HookScope::Test,
            assembly: Some(unit.class.assembly.clone()),
            class: Some(unit.class.name.clone()),
            unit_id: Some(unit.id.clone()),
            method: Some(unit.method.clone()),
            display_name: Some(unit.display_name.clone()),
            categories: unit.categories.clone(),
            properties: unit.properties.clone(),
        }
    }

    fn bare(scope: HookScope) -> Self {
        Self {
            scope,
            assembly: None,
            class: None,
            unit_id: None,
            method: None,
            display_name: None,
            categories: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Identifier used in hook failure records.
    pub fn target(&self) -> String {
        if let Some(id) = &self.unit_id {
            return id.to_string();
        }
        match self.scope {
            HookScope::Class => self.class.clone().unwrap_or_default(),
            HookScope::Assembly => self.assembly.clone().unwrap_or_default(),
            HookScope::TestDiscovery => "discovery".to_string(),
            _ => "session".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// TestCtx
// ---------------------------------------------------------------------------

/// An argument after fixture instantiation.
#[derive(Clone)]
pub enum ResolvedArg {
    Value(Value),
    Fixture(Arc<dyn Fixture>),
}

impl ResolvedArg {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ResolvedArg::Value(v) => Some(v),
            ResolvedArg::Fixture(_) => None,
        }
    }

    pub fn fixture(&self) -> Option<&dyn Fixture> {
        match self {
            ResolvedArg::Value(_) => None,
            ResolvedArg::Fixture(f) => Some(&**f),
        }
    }
}

struct TestCtxInner {
    run_id: String,
    unit: Arc<TestUnit>,
    class_args: Vec<ResolvedArg>,
    args: Vec<ResolvedArg>,
    instance: Option<Arc<dyn Fixture>>,
    ambient: Ambient,
    state: StateBag,
    dependencies: Vec<DependencyRecord>,
    attempt: AtomicU32,
    outcome: RwLock<Option<Outcome>>,
    output: Mutex<String>,
}

/// Context of one test unit, shared by its hooks, receivers and body.
///
/// Cheap to clone. Each clone may carry its own cancellation token, so a
/// timed-out hook can be cancelled without touching the body.
#[derive(Clone)]
pub struct TestCtx {
    inner: Arc<TestCtxInner>,
    cancel: CancellationToken,
}

impl TestCtx {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        unit: Arc<TestUnit>,
        class_args: Vec<ResolvedArg>,
        args: Vec<ResolvedArg>,
        instance: Option<Arc<dyn Fixture>>,
        ambient: Ambient,
        dependencies: Vec<DependencyRecord>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(TestCtxInner {
                run_id,
                unit,
                class_args,
                args,
                instance,
                ambient,
                state: StateBag::default(),
                dependencies,
                attempt: AtomicU32::new(0),
                outcome: RwLock::new(None),
                output: Mutex::new(String::new()),
            }),
            cancel,
        }
    }

    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cancel,
        }
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.inner.attempt.store(attempt, Ordering::SeqCst);
    }

    pub(crate) fn set_outcome(&self, outcome: Option<Outcome>) {
        *self.inner.outcome.write() = outcome;
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn unit(&self) -> &TestUnit {
        &self.inner.unit
    }

    pub fn id(&self) -> &UnitId {
        &self.inner.unit.id
    }

    pub fn class_name(&self) -> &str {
        self.inner.unit.class_name()
    }

    pub fn method(&self) -> &str {
        &self.inner.unit.method
    }

    pub fn display_name(&self) -> &str {
        &self.inner.unit.display_name
    }

    pub fn info(&self) -> ScopeInfo {
        ScopeInfo::test(&self.inner.unit)
    }

    pub fn args(&self) -> &[ResolvedArg] {
        &self.inner.args
    }

    /// Method argument `index`, when it is a plain value.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.inner.args.get(index)?.value()
    }

    /// Method argument `index`, when it is a fixture of type `T`.
    pub fn fixture<T: Fixture>(&self, index: usize) -> Option<&T> {
        self.inner.args.get(index)?.fixture()?.downcast_ref::<T>()
    }

    pub fn class_args(&self) -> &[ResolvedArg] {
        &self.inner.class_args
    }

    pub fn class_arg(&self, index: usize) -> Option<&Value> {
        self.inner.class_args.get(index)?.value()
    }

    pub fn class_fixture<T: Fixture>(&self, index: usize) -> Option<&T> {
        self.inner.class_args.get(index)?.fixture()?.downcast_ref::<T>()
    }

    /// The per-test class instance, if the class declares a factory.
    pub fn instance<T: Fixture>(&self) -> Option<&T> {
        self.inner.instance.as_deref()?.downcast_ref::<T>()
    }

    pub fn ambient(&self) -> &Ambient {
        &self.inner.ambient
    }

    pub fn state(&self) -> &StateBag {
        &self.inner.state
    }

    /// Every dependency, direct and transitive, each exactly once.
    pub fn dependencies(&self) -> &[DependencyRecord] {
        &self.inner.dependencies
    }

    /// Current attempt, 1-based. 0 before the first attempt.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    /// Outcome of the current attempt; set once the body finishes, so After
    /// hooks and end receivers can read it.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.outcome.read().clone()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append a line to the unit's captured output.
    pub fn write_output(&self, line: impl AsRef<str>) {
        let mut output = self.inner.output.lock();
        output.push_str(line.as_ref());
        output.push('\n');
    }

    pub fn output(&self) -> String {
        self.inner.output.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// HookCtx
// ---------------------------------------------------------------------------

/// Context handed to hooks and scope receivers.
#[derive(Clone)]
pub struct HookCtx {
    info: Arc<ScopeInfo>,
    ambient: Ambient,
    cancel: CancellationToken,
    test: Option<TestCtx>,
    discovery: Option<DiscoveryCtx>,
}

impl HookCtx {
    pub(crate) fn scope(info: ScopeInfo, ambient: Ambient, cancel: CancellationToken) -> Self {
        Self {
            info: Arc::new(info),
            ambient,
            cancel,
            test: None,
            discovery: None,
        }
    }

    pub(crate) fn for_test(test: &TestCtx) -> Self {
        Self {
            info: Arc::new(test.info()),
            ambient: test.ambient().clone(),
            cancel: test.cancellation().clone(),
            test: Some(test.clone()),
            discovery: None,
        }
    }

    pub(crate) fn for_discovery(discovery: DiscoveryCtx, ambient: Ambient) -> Self {
        Self {
            info: Arc::new(ScopeInfo::discovery()),
            ambient,
            cancel: CancellationToken::new(),
            test: None,
            discovery: Some(discovery),
        }
    }

    /// Same scope, different cancellation token. The test context, if any,
    /// is re-bound to the new token too.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            info: Arc::clone(&self.info),
            ambient: self.ambient.clone(),
            test: self.test.as_ref().map(|t| t.with_cancel(cancel.clone())),
            discovery: self.discovery.clone(),
            cancel,
        }
    }

    pub fn info(&self) -> &ScopeInfo {
        &self.info
    }

    pub fn scope_kind(&self) -> HookScope {
        self.info.scope
    }

    pub fn class_name(&self) -> Option<&str> {
        self.info.class.as_deref()
    }

    pub fn assembly(&self) -> Option<&str> {
        self.info.assembly.as_deref()
    }

    pub fn ambient(&self) -> &Ambient {
        &self.ambient
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The test, for Test-scope hooks.
    pub fn test(&self) -> Option<&TestCtx> {
        self.test.as_ref()
    }

    /// Discovery access, for TestDiscovery-scope hooks.
    pub fn discovery(&self) -> Option<&DiscoveryCtx> {
        self.discovery.as_ref()
    }
}

// ---------------------------------------------------------------------------
// DiscoveryCtx / RegistrationCtx
// ---------------------------------------------------------------------------

/// Lets discovery hooks add tests and inspect the discovered units.
#[derive(Clone, Default)]
pub struct DiscoveryCtx {
    added: Arc<Mutex<Vec<TestTemplate>>>,
    discovered: Arc<RwLock<Vec<ScopeInfo>>>,
}

impl DiscoveryCtx {
    /// Register another test. Only honoured from Before(TestDiscovery).
    pub fn add_test(&self, template: TestTemplate) {
        self.added.lock().push(template);
    }

    /// Units found by discovery. Empty until After(TestDiscovery).
    pub fn discovered(&self) -> Vec<ScopeInfo> {
        self.discovered.read().clone()
    }

    pub(crate) fn take_added(&self) -> Vec<TestTemplate> {
        std::mem::take(&mut *self.added.lock())
    }

    pub(crate) fn set_discovered(&self, units: Vec<ScopeInfo>) {
        *self.discovered.write() = units;
    }
}

/// Handed to [`EventReceiver::on_test_registered`](crate::traits::EventReceiver::on_test_registered).
#[derive(Debug, Clone)]
pub struct RegistrationCtx {
    info: ScopeInfo,
    dependencies: Vec<DependencyRecord>,
    skip: Option<String>,
}

impl RegistrationCtx {
    pub(crate) fn new(
        info: ScopeInfo,
        dependencies: Vec<DependencyRecord>,
        skip: Option<String>,
    ) -> Self {
        Self {
            info,
            dependencies,
            skip,
        }
    }

    pub fn info(&self) -> &ScopeInfo {
        &self.info
    }

    /// Fully resolved dependencies, direct and transitive.
    pub fn dependencies(&self) -> &[DependencyRecord] {
        &self.dependencies
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.skip.as_deref()
    }

    pub fn set_skip(&mut self, reason: impl Into<String>) {
        self.skip = Some(reason.into());
    }

    pub(crate) fn into_skip(self) -> Option<String> {
        self.skip
    }
}
