//! Argument and data-source declarations.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::{DataProducer, FixtureFactory};

/// Declared shape of a parameter. `Scalar` accepts any value unchanged;
/// `Tuple` requires an array with one element per part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Shape {
    #[default]
    Scalar,
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::Scalar => true,
            Shape::Tuple(parts) => value.as_array().is_some_and(|items| {
                items.len() == parts.len()
                    && parts.iter().zip(items).all(|(shape, v)| shape.matches(v))
            }),
        }
    }
}

/// One declared parameter of a test method or class constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Shape,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: Shape::Scalar,
            default: None,
        }
    }

    pub fn tuple(name: impl Into<String>, parts: Vec<Shape>) -> Self {
        Self {
            name: name.into(),
            shape: Shape::Tuple(parts),
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Lifetime and sharing key of a fixture instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingScope {
    /// A fresh instance for every consumer.
    None,
    PerTestClass,
    PerKey(String),
    PerAssembly,
    PerTestSession,
    Global,
}

/// Request for a fixture instance produced by `factory` and shared per
/// `scope`.
#[derive(Clone)]
pub struct FixtureRequest {
    pub factory: Arc<dyn FixtureFactory>,
    pub scope: SharingScope,
}

impl FixtureRequest {
    pub fn new(factory: impl FixtureFactory + 'static, scope: SharingScope) -> Self {
        Self {
            factory: Arc::new(factory),
            scope,
        }
    }

    pub fn shared(factory: Arc<dyn FixtureFactory>, scope: SharingScope) -> Self {
        Self { factory, scope }
    }
}

impl fmt::Debug for FixtureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureRequest")
            .field("factory", &self.factory.name())
            .field("scope", &self.scope)
            .finish()
    }
}

/// A producer of argument values.
#[derive(Clone)]
pub enum DataSource {
    /// One invocation; one value per parameter, already split.
    Row(Vec<Value>),
    /// Items generated at discovery time. On a row axis each item is
    /// unwrapped across the parameters; on a parameter axis each item is one
    /// value for that parameter.
    Producer(Arc<dyn DataProducer>),
    /// Alternative values for a single parameter.
    Values(Vec<Value>),
    /// A shared fixture instance.
    Fixture(FixtureRequest),
}

impl DataSource {
    pub fn row(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Row(values.into_iter().collect())
    }

    pub fn values(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Values(values.into_iter().collect())
    }

    pub fn producer(producer: impl DataProducer + 'static) -> Self {
        Self::Producer(Arc::new(producer))
    }

    pub fn fixture(factory: impl FixtureFactory + 'static, scope: SharingScope) -> Self {
        Self::Fixture(FixtureRequest::new(factory, scope))
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Row(v) => f.debug_tuple("Row").field(v).finish(),
            DataSource::Producer(p) => f.debug_tuple("Producer").field(&p.name()).finish(),
            DataSource::Values(v) => f.debug_tuple("Values").field(v).finish(),
            DataSource::Fixture(r) => f.debug_tuple("Fixture").field(r).finish(),
        }
    }
}

/// Parameters of a method or constructor together with their sources.
#[derive(Debug, Clone, Default)]
pub struct DataSignature {
    pub params: Vec<ParamSpec>,
    /// Sources that each yield whole invocations. Additive.
    pub rows: Vec<DataSource>,
    /// Sources bound to one named parameter. Additive per parameter,
    /// multiplicative across parameters.
    pub per_param: Vec<(String, DataSource)>,
    /// Treat a source that yields nothing as a discovery error.
    pub require_data: bool,
}

impl DataSignature {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.rows.is_empty() && self.per_param.is_empty()
    }
}

/// A resolved argument slot before fixtures are instantiated.
#[derive(Debug, Clone)]
pub enum Argument {
    Value(Value),
    Fixture(FixtureRequest),
}

impl Argument {
    /// Short form used in display names.
    pub fn describe(&self) -> String {
        match self {
            Argument::Value(Value::String(s)) => format!("{s:?}"),
            Argument::Value(v) => v.to_string(),
            Argument::Fixture(r) => r.factory.name().to_string(),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Argument::Value(v) => Some(v),
            Argument::Fixture(_) => None,
        }
    }
}
