//! Test templates, classes and expanded test units.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    Argument, ConstraintKey, DataSignature, DataSource, ParallelGroup, ParallelLimit, ParamSpec,
    Priority, RetryPolicy, DEFAULT_ASSEMBLY,
};
use crate::traits::{EventReceiver, FixtureFactory, SkipCondition, TestBody};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identity of one expanded test unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyTarget {
    /// Every data variant of a test method. `class: None` means the
    /// dependent's own class.
    Test {
        class: Option<String>,
        method: String,
    },
    /// Every test of a class.
    Class(String),
}

impl fmt::Display for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyTarget::Test {
                class: Some(c),
                method,
            } => write!(f, "{c}.{method}"),
            DependencyTarget::Test {
                class: None,
                method,
            } => f.write_str(method),
            DependencyTarget::Class(c) => write!(f, "{c}.*"),
        }
    }
}

/// A declared dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependsOn {
    pub target: DependencyTarget,
    #[serde(default)]
    pub proceed_on_failure: bool,
}

impl DependsOn {
    /// A test method in the dependent's own class.
    pub fn test(method: impl Into<String>) -> Self {
        Self {
            target: DependencyTarget::Test {
                class: None,
                method: method.into(),
            },
            proceed_on_failure: false,
        }
    }

    pub fn test_in(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: DependencyTarget::Test {
                class: Some(class.into()),
                method: method.into(),
            },
            proceed_on_failure: false,
        }
    }

    pub fn class(class: impl Into<String>) -> Self {
        Self {
            target: DependencyTarget::Class(class.into()),
            proceed_on_failure: false,
        }
    }

    /// Run the dependent once the dependency is terminal, whatever its
    /// outcome.
    pub fn proceed_on_failure(mut self) -> Self {
        self.proceed_on_failure = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

/// Runtime-visible description of a test class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub name: String,
    pub assembly: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
}

/// Registration of a test class: constructor data, instance factory and
/// declarations applied to every test of the class.
#[derive(Clone)]
pub struct ClassDecl {
    pub(crate) descriptor: ClassDescriptor,
    pub(crate) ctor: DataSignature,
    pub(crate) instance: Option<Arc<dyn FixtureFactory>>,
    pub(crate) keys: Vec<ConstraintKey>,
    pub(crate) group: Option<ParallelGroup>,
    pub(crate) limit: Option<ParallelLimit>,
    pub(crate) priority: Option<Priority>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) skip: Option<String>,
    pub(crate) dependencies: Vec<DependsOn>,
    pub(crate) receivers: Vec<Arc<dyn EventReceiver>>,
}

impl ClassDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ClassDescriptor {
                name: name.into(),
                assembly: DEFAULT_ASSEMBLY.to_string(),
                base: None,
                affinity: None,
            },
            ctor: DataSignature::default(),
            instance: None,
            keys: Vec::new(),
            group: None,
            limit: None,
            priority: None,
            retry: None,
            timeout: None,
            skip: None,
            dependencies: Vec::new(),
            receivers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn assembly(mut self, assembly: impl Into<String>) -> Self {
        self.descriptor.assembly = assembly.into();
        self
    }

    pub fn inherits(mut self, base: impl Into<String>) -> Self {
        self.descriptor.base = Some(base.into());
        self
    }

    pub fn affinity(mut self, dispatcher: impl Into<String>) -> Self {
        self.descriptor.affinity = Some(dispatcher.into());
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.ctor.params.push(param);
        self
    }

    pub fn source(mut self, source: DataSource) -> Self {
        self.ctor.rows.push(source);
        self
    }

    pub fn param_source(mut self, param: impl Into<String>, source: DataSource) -> Self {
        self.ctor.per_param.push((param.into(), source));
        self
    }

    pub fn require_data(mut self) -> Self {
        self.ctor.require_data = true;
        self
    }

    /// Factory for the per-test class instance.
    pub fn instance(mut self, factory: impl FixtureFactory + 'static) -> Self {
        self.instance = Some(Arc::new(factory));
        self
    }

    pub fn not_in_parallel(mut self, key: impl Into<String>) -> Self {
        self.keys.push(ConstraintKey::new(key));
        self
    }

    pub fn not_in_parallel_ordered(mut self, key: impl Into<String>, order: i32) -> Self {
        self.keys.push(ConstraintKey::ordered(key, order));
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(ParallelGroup::new(group));
        self
    }

    pub fn limit(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.limit = Some(ParallelLimit::new(name, limit));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    pub fn depends_on(mut self, dependency: DependsOn) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn receiver(mut self, receiver: impl EventReceiver + 'static) -> Self {
        self.receivers.push(Arc::new(receiver));
        self
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A declared test method, before data expansion.
#[derive(Clone)]
pub struct TestTemplate {
    pub(crate) class: String,
    pub(crate) method: String,
    pub(crate) display_name: Option<String>,
    pub(crate) signature: DataSignature,
    pub(crate) body: Arc<dyn TestBody>,
    pub(crate) dependencies: Vec<DependsOn>,
    pub(crate) keys: Vec<ConstraintKey>,
    pub(crate) group: Option<ParallelGroup>,
    pub(crate) limit: Option<ParallelLimit>,
    pub(crate) priority: Option<Priority>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) skip: Option<String>,
    pub(crate) skip_when: Option<Arc<dyn SkipCondition>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) affinity: Option<String>,
    pub(crate) repeat: u32,
    pub(crate) categories: Vec<String>,
    pub(crate) properties: BTreeMap<String, String>,
}

impl TestTemplate {
    pub fn new(
        class: impl Into<String>,
        method: impl Into<String>,
        body: impl TestBody + 'static,
    ) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            display_name: None,
            signature: DataSignature::default(),
            body: Arc::new(body),
            dependencies: Vec::new(),
            keys: Vec::new(),
            group: None,
            limit: None,
            priority: None,
            retry: None,
            skip: None,
            skip_when: None,
            timeout: None,
            affinity: None,
            repeat: 0,
            categories: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.signature.params.push(param);
        self
    }

    pub fn source(mut self, source: DataSource) -> Self {
        self.signature.rows.push(source);
        self
    }

    pub fn param_source(mut self, param: impl Into<String>, source: DataSource) -> Self {
        self.signature.per_param.push((param.into(), source));
        self
    }

    pub fn require_data(mut self) -> Self {
        self.signature.require_data = true;
        self
    }

    pub fn depends_on(mut self, dependency: DependsOn) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn not_in_parallel(mut self, key: impl Into<String>) -> Self {
        self.keys.push(ConstraintKey::new(key));
        self
    }

    pub fn not_in_parallel_ordered(mut self, key: impl Into<String>, order: i32) -> Self {
        self.keys.push(ConstraintKey::ordered(key, order));
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(ParallelGroup::new(group));
        self
    }

    pub fn limit(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.limit = Some(ParallelLimit::new(name, limit));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    /// Skip decided at registration time.
    pub fn skip_when(mut self, condition: impl SkipCondition + 'static) -> Self {
        self.skip_when = Some(Arc::new(condition));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn affinity(mut self, dispatcher: impl Into<String>) -> Self {
        self.affinity = Some(dispatcher.into());
        self
    }

    /// Run every expanded variant `count` additional times.
    pub fn repeat(mut self, count: u32) -> Self {
        self.repeat = count;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// TestUnit
// ---------------------------------------------------------------------------

/// Partition a unit belongs to for group exclusivity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    Ungrouped,
    Group(ParallelGroup),
}

/// One concrete, fully expanded test invocation.
///
/// Immutable once the plan is built; results are recorded separately.
#[derive(Clone)]
pub struct TestUnit {
    pub id: UnitId,
    /// Registration sequence across the whole plan.
    pub seq: usize,
    pub class: Arc<ClassDescriptor>,
    pub method: String,
    pub display_name: String,
    pub class_args: Vec<Argument>,
    pub method_args: Vec<Argument>,
    pub dependencies: Vec<DependsOn>,
    pub constraint_keys: Vec<ConstraintKey>,
    pub group: Option<ParallelGroup>,
    pub limit: Option<ParallelLimit>,
    pub priority: Priority,
    pub retry: RetryPolicy,
    pub skip: Option<String>,
    pub timeout: Option<Duration>,
    /// Resolved dispatcher: method, then class ancestry, then assembly.
    pub affinity: Option<String>,
    pub repeat_index: u32,
    pub categories: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub(crate) instance: Option<Arc<dyn FixtureFactory>>,
    pub(crate) body: Arc<dyn TestBody>,
    pub(crate) skip_when: Option<Arc<dyn SkipCondition>>,
}

impl TestUnit {
    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    pub fn assembly(&self) -> &str {
        &self.class.assembly
    }

    pub fn partition(&self) -> Partition {
        match &self.group {
            Some(g) => Partition::Group(g.clone()),
            None => Partition::Ungrouped,
        }
    }

    /// Lowest explicit key order, used to sort ready candidates.
    pub fn min_key_order(&self) -> Option<i32> {
        self.constraint_keys.iter().filter_map(|k| k.order).min()
    }

    /// Order declared for `key`, if the unit holds it with one.
    pub fn key_order(&self, key: &str) -> Option<i32> {
        self.constraint_keys
            .iter()
            .find(|k| k.name == key)
            .and_then(|k| k.order)
    }
}

impl fmt::Debug for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestUnit")
            .field("id", &self.id)
            .field("class", &self.class.name)
            .field("method", &self.method)
            .field("priority", &self.priority)
            .field("constraint_keys", &self.constraint_keys)
            .field("group", &self.group)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}
