//! Hook declarations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::traits::{Hook, SkipCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookScope {
    Test,
    Class,
    Assembly,
    TestSession,
    TestDiscovery,
}

impl fmt::Display for HookScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookScope::Test => "test",
            HookScope::Class => "class",
            HookScope::Assembly => "assembly",
            HookScope::TestSession => "test_session",
            HookScope::TestDiscovery => "test_discovery",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTiming {
    Before,
    After,
}

/// Where a hook was declared, which decides where in a chain it runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookLevel {
    /// Declared on a class; applies to that class and every class deriving
    /// from it.
    Class(String),
    /// Applies to every class of the named assembly.
    Assembly(String),
    /// Applies everywhere.
    Every,
}

/// What a failing hook does to its scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailurePolicy {
    /// The scope fails: a Before failure stops the body, a class-level
    /// Before failure skips the class.
    #[default]
    FailScope,
    /// The failure is recorded and execution continues.
    Continue,
}

/// Sub-stage of an event receiver relative to the scope's own hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverStage {
    Early,
    #[default]
    Late,
}

/// A registered hook.
#[derive(Clone)]
pub struct HookDescriptor {
    pub name: String,
    pub scope: HookScope,
    pub timing: HookTiming,
    pub level: HookLevel,
    pub order: i32,
    pub timeout: Option<Duration>,
    pub affinity: Option<String>,
    pub on_failure: HookFailurePolicy,
    pub(crate) skip: Option<Arc<dyn SkipCondition>>,
    pub(crate) body: Arc<dyn Hook>,
    /// Registration sequence; ties on `order` keep declaration order.
    pub(crate) seq: usize,
}

impl HookDescriptor {
    fn new(
        scope: HookScope,
        timing: HookTiming,
        name: impl Into<String>,
        body: impl Hook + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            scope,
            timing,
            level: HookLevel::Every,
            order: 0,
            timeout: None,
            affinity: None,
            on_failure: HookFailurePolicy::FailScope,
            skip: None,
            body: Arc::new(body),
            seq: 0,
        }
    }

    pub fn before(scope: HookScope, name: impl Into<String>, body: impl Hook + 'static) -> Self {
        Self::new(scope, HookTiming::Before, name, body)
    }

    pub fn after(scope: HookScope, name: impl Into<String>, body: impl Hook + 'static) -> Self {
        Self::new(scope, HookTiming::After, name, body)
    }

    pub fn on_class(mut self, class: impl Into<String>) -> Self {
        self.level = HookLevel::Class(class.into());
        self
    }

    pub fn on_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.level = HookLevel::Assembly(assembly.into());
        self
    }

    pub fn every(mut self) -> Self {
        self.level = HookLevel::Every;
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
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

    pub fn skip_when(mut self, condition: impl SkipCondition + 'static) -> Self {
        self.skip = Some(Arc::new(condition));
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = HookFailurePolicy::Continue;
        self
    }
}

impl fmt::Debug for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDescriptor")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("timing", &self.timing)
            .field("level", &self.level)
            .field("order", &self.order)
            .field("timeout", &self.timeout)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}
