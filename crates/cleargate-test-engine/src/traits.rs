//! Plugin trait interfaces for the test engine.
//!
//! Test bodies, hooks, data producers, fixtures, receivers, reporters and
//! dispatchers are all defined as traits. Adding a method to any trait
//! requires a default implementation to preserve backward compatibility.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::context::{HookCtx, RegistrationCtx, ScopeInfo, TestCtx};
use super::errors::ReporterError;
use super::run_event::RunEvent;
use super::types::*;

// ---------------------------------------------------------------------------
// TestBody / Hook
// ---------------------------------------------------------------------------

/// The opaque body of a test.
#[async_trait]
pub trait TestBody: Send + Sync {
    async fn run(&self, ctx: &TestCtx) -> Result<(), TestError>;
}

/// A Before/After hook at any scope.
///
/// Hooks should observe [`HookCtx::cancellation`] when they await long
/// operations; a timed-out hook's token is cancelled.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: &HookCtx) -> Result<(), TestError>;
}

struct FnBody<F>(F);

#[async_trait]
impl<F, Fut> TestBody for FnBody<F>
where
    F: Fn(TestCtx) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TestError>> + Send + 'static,
{
    async fn run(&self, ctx: &TestCtx) -> Result<(), TestError> {
        (self.0)(ctx.clone()).await
    }
}

struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(HookCtx) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TestError>> + Send + 'static,
{
    async fn run(&self, ctx: &HookCtx) -> Result<(), TestError> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a [`TestBody`]. The closure receives an owned
/// (cheaply cloned) context.
pub fn body_fn<F, Fut>(f: F) -> impl TestBody
where
    F: Fn(TestCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TestError>> + Send + 'static,
{
    FnBody(f)
}

/// Wrap an async closure as a [`Hook`].
pub fn hook_fn<F, Fut>(f: F) -> impl Hook
where
    F: Fn(HookCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TestError>> + Send + 'static,
{
    FnHook(f)
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Decides whether a hook or test is skipped. Returns the skip reason.
#[async_trait]
pub trait SkipCondition: Send + Sync {
    async fn evaluate(&self, target: &ScopeInfo) -> Option<String>;
}

#[async_trait]
impl<F> SkipCondition for F
where
    F: Fn(&ScopeInfo) -> Option<String> + Send + Sync,
{
    async fn evaluate(&self, target: &ScopeInfo) -> Option<String> {
        self(target)
    }
}

/// Decides whether a failed attempt (1-based) is retried.
pub trait RetryCondition: Send + Sync {
    fn should_retry(&self, error: &TestError, attempt: u32) -> bool;
}

impl<F> RetryCondition for F
where
    F: Fn(&TestError, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &TestError, attempt: u32) -> bool {
        self(error, attempt)
    }
}

// ---------------------------------------------------------------------------
// DataProducer
// ---------------------------------------------------------------------------

/// Generates argument items at discovery time.
#[async_trait]
pub trait DataProducer: Send + Sync {
    fn name(&self) -> &str;

    async fn produce(&self) -> Result<Vec<Value>, TestError>;
}

struct FnProducer<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> DataProducer for FnProducer<F>
where
    F: Fn() -> Vec<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(&self) -> Result<Vec<Value>, TestError> {
        Ok((self.f)())
    }
}

/// Wrap a synchronous generator as a [`DataProducer`].
pub fn producer_fn<F>(name: impl Into<String>, f: F) -> impl DataProducer
where
    F: Fn() -> Vec<Value> + Send + Sync + 'static,
{
    FnProducer {
        name: name.into(),
        f,
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Upcast helper so fixtures can be downcast to their concrete type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A shared instance handed to tests as an argument or as the class
/// instance.
///
/// Both disposal forms are honoured when the last consumer releases it:
/// `dispose` first, then `dispose_async`.
#[async_trait]
pub trait Fixture: AsAny {
    /// Runs once, after every nested fixture is initialized and before the
    /// instance reaches any consumer.
    async fn initialize(&self) -> Result<(), TestError> {
        Ok(())
    }

    fn dispose(&self) {}

    async fn dispose_async(&self) {}
}

impl dyn Fixture {
    pub fn downcast_ref<T: Fixture>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Builds fixture instances. `name` identifies the producer type in sharing
/// keys, so two factories with the same name share instances: whichever
/// consumer gets there first builds the instance for all of them. Names
/// must be unique per kind of instance.
#[async_trait]
pub trait FixtureFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Fixtures injected into the instance this factory builds.
    fn nested(&self) -> Vec<FixtureRequest> {
        Vec::new()
    }

    /// Construct the instance. `nested` holds the initialized instances for
    /// [`nested()`](Self::nested), in the same order.
    async fn create(&self, nested: Vec<Arc<dyn Fixture>>) -> Result<Arc<dyn Fixture>, TestError>;
}

// ---------------------------------------------------------------------------
// EventReceiver
// ---------------------------------------------------------------------------

/// Observer of test and scope transitions. Receivers attached to a class
/// apply to that class and classes deriving from it; receivers registered
/// on the engine apply everywhere.
///
/// [`stage()`](Self::stage) decides whether start/end callbacks run before
/// (`Early`) or after (`Late`) the scope's own hooks.
#[async_trait]
pub trait EventReceiver: Send + Sync {
    fn name(&self) -> &str;

    fn stage(&self) -> ReceiverStage {
        ReceiverStage::Late
    }

    /// Called while planning, after dependencies are resolved. May set a
    /// skip reason.
    async fn on_test_registered(&self, _ctx: &mut RegistrationCtx) {}

    async fn on_test_start(&self, _ctx: &TestCtx) -> Result<(), TestError> {
        Ok(())
    }

    async fn on_test_end(&self, _ctx: &TestCtx) -> Result<(), TestError> {
        Ok(())
    }

    async fn on_test_skipped(&self, _ctx: &TestCtx) {}

    /// Class, assembly or session start; see [`HookCtx::scope`].
    async fn on_scope_start(&self, _ctx: &HookCtx) -> Result<(), TestError> {
        Ok(())
    }

    async fn on_scope_end(&self, _ctx: &HookCtx) -> Result<(), TestError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Receives every [`RunEvent`] of a run, in sequence order.
///
/// Errors are logged and never fail the run.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, event: &RunEvent) -> Result<(), ReporterError>;

    /// Called once after `RunCompleted`.
    async fn flush(&self) -> Result<(), ReporterError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LoadProbe
// ---------------------------------------------------------------------------

/// Source of the CPU occupancy signal used by the adaptive ceiling.
pub trait LoadProbe: Send + Sync {
    /// CPU occupancy in percent (0-100), or `None` when unavailable.
    fn cpu_percent(&self) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// An execution context that test bodies and hooks can be pinned to.
///
/// The engine wraps `work` so that
/// [`current_dispatcher()`](crate::dispatch::current_dispatcher) reports
/// [`id()`](Self::id) wherever it is polled.
pub trait Dispatcher: Send + Sync {
    fn id(&self) -> &str;

    fn dispatch(
        &self,
        work: BoxFuture<'static, Result<(), TestError>>,
    ) -> BoxFuture<'static, Result<(), TestError>>;
}
