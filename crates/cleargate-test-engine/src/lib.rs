//! Cleargate test engine: a test-execution orchestrator.
//!
//! Registered test templates are expanded against their data sources into
//! concrete units, ordered by a dependency graph and dispatched by a
//! constraint-aware scheduler. Each unit runs inside a hook pipeline that
//! brackets tests, classes, assemblies and the whole session, while a
//! reference-counted lifecycle manager creates and disposes shared
//! instances.
//!
//! The engine is a library: it has no opinion on how tests are written or
//! discovered beyond the registration API, and reports through
//! [`RunEvent`]s and [`Reporter`]s.

pub mod context;
pub mod defaults;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod expand;
pub mod graph;
pub mod hooks;
pub mod lifecycle;
pub mod run_event;
pub mod scheduler;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

// Re-export public types at the crate level.

// context
pub use context::{
    Ambient, DiscoveryCtx, HookCtx, RegistrationCtx, ResolvedArg, ScopeInfo, StateBag, TestCtx,
};

// defaults
pub use defaults::{FileReporter, InMemoryReporter, LoadAvgProbe, StaticLoadProbe, TracingReporter};

// dispatch
pub use dispatch::{InlineDispatcher, RuntimeDispatcher, current_dispatcher};

// engine
pub use engine::{Engine, EngineBuilder, EngineError, TestPlan};

// errors
pub use errors::{ConfigError, DiscoveryError, FixtureError, ReporterError};

// executor
pub use executor::{ExecutionHandle, ExecutorConfig};

// lifecycle
pub use lifecycle::{FixtureManager, FixtureStats};

// run_event
pub use run_event::{HookStatus, RunEvent};

// scheduler
pub use scheduler::AdaptiveConfig;

// traits
pub use traits::{
    DataProducer, Dispatcher, EventReceiver, Fixture, FixtureFactory, Hook, LoadProbe, Reporter,
    RetryCondition, SkipCondition, TestBody, body_fn, hook_fn, producer_fn,
};

// types
pub use types::*;
