//! Error types for discovery, shared-instance lifecycle, reporting and configuration.

use thiserror::Error;

/// Errors raised while turning registered templates into a runnable plan.
///
/// Any of these fails the whole run before a single test executes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// A parameter has neither a producer nor a default value.
    #[error("{test}: parameter `{param}` has no data source and no default")]
    MissingProducer { test: String, param: String },
    /// A produced row does not fit the declared parameter list.
    #[error("{test}: data row has {found} values but the signature takes {expected}")]
    ArityMismatch {
        test: String,
        expected: usize,
        found: usize,
    },
    /// A value does not have the tuple shape its parameter declares.
    #[error("{test}: value for parameter `{param}` does not match its declared shape")]
    ShapeMismatch { test: String, param: String },
    /// A per-parameter source names a parameter the signature does not declare.
    #[error("{test}: no parameter named `{param}`")]
    UnknownParameter { test: String, param: String },
    /// Row-level and per-parameter sources were mixed on one signature.
    #[error("{test}: row sources and per-parameter sources cannot be combined")]
    MixedSources { test: String },
    /// A source produced nothing and the template requires at least one row.
    #[error("{test}: data source produced no rows")]
    EmptyDataSource { test: String },
    /// A data producer failed.
    #[error("{test}: data producer `{producer}` failed: {message}")]
    Producer {
        test: String,
        producer: String,
        message: String,
    },
    /// A template or base-class reference names an unregistered class.
    #[error("unknown class: {name}")]
    UnknownClass { name: String },
    /// The base-class chain of a class loops back on itself.
    #[error("inheritance cycle through class {class}")]
    InheritanceCycle { class: String },
    /// Two expanded units produced the same identity.
    #[error("duplicate test unit: {id}")]
    DuplicateUnit { id: String },
    /// A dependency target matched no registered test.
    #[error("{test}: dependency `{target}` matches no registered test")]
    UnknownDependency { test: String, target: String },
    /// The dependency edges form a cycle.
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
    /// A unit depends on a unit that must start after it on the same key.
    #[error(
        "constraint key `{key}`: {dependent} (order {dependent_order}) depends on {dependency} (order {dependency_order})"
    )]
    OrderConflict {
        key: String,
        dependent: String,
        dependent_order: i32,
        dependency: String,
        dependency_order: i32,
    },
    /// An affinity names a dispatcher that was never registered.
    #[error("unknown dispatcher: {id}")]
    UnknownDispatcher { id: String },
    /// A test-discovery hook failed.
    #[error("discovery hook `{hook}` failed: {message}")]
    DiscoveryHook { hook: String, message: String },
}

/// Errors from [`FixtureFactory`](super::traits::FixtureFactory) and
/// [`Fixture`](super::traits::Fixture) implementations.
///
/// `Clone` so that a failed single-flight creation can be reported to every
/// waiting consumer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FixtureError {
    #[error("fixture `{factory}` could not be created: {message}")]
    Create { factory: String, message: String },
    #[error("fixture `{factory}` failed to initialize: {message}")]
    Initialize { factory: String, message: String },
    #[error("nested fixture cycle: {}", chain.join(" -> "))]
    NestedCycle { chain: Vec<String> },
}

/// Errors from [`Reporter`](super::traits::Reporter) implementations.
#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("reporter io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reporter serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("reporter error: {message}")]
    Reporter { message: String },
}

/// Errors from reading [`ExecutorConfig`](super::executor::ExecutorConfig)
/// out of the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}
