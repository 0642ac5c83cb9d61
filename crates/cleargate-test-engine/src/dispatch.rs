//! Executor affinity.
//!
//! A unit's body and its Test-scope hooks all run through the dispatcher
//! resolved for the unit (method, then class ancestry, then assembly), so
//! they observe the same [`current_dispatcher`] identity.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::{Handle, Runtime};
use tokio_util::task::AbortOnDropHandle;

use crate::traits::Dispatcher;
use crate::types::TestError;

tokio::task_local! {
    static CURRENT_DISPATCHER: Arc<str>;
}

/// Identity of the dispatcher running the current body or hook, or `None`
/// when running without an affinity.
pub fn current_dispatcher() -> Option<String> {
    CURRENT_DISPATCHER.try_with(|id| id.to_string()).ok()
}

/// Runs work in place on the calling task.
#[derive(Debug, Clone)]
pub struct InlineDispatcher {
    id: String,
}

impl InlineDispatcher {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Dispatcher for InlineDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn dispatch(
        &self,
        work: BoxFuture<'static, Result<(), TestError>>,
    ) -> BoxFuture<'static, Result<(), TestError>> {
        work
    }
}

/// Spawns work onto a tokio runtime, either an existing one or a dedicated
/// runtime owned by the dispatcher.
///
/// Dropping the future returned by `dispatch` aborts the spawned task, so a
/// body abandoned by a timeout or cancellation does not outlive its unit.
pub struct RuntimeDispatcher {
    id: String,
    handle: Handle,
    owned: Option<Runtime>,
}

impl RuntimeDispatcher {
    pub fn from_handle(id: impl Into<String>, handle: Handle) -> Self {
        Self {
            id: id.into(),
            handle,
            owned: None,
        }
    }

    /// Build a dedicated multi-thread runtime whose worker threads are named
    /// `{id}-worker`.
    pub fn dedicated(id: impl Into<String>, worker_threads: usize) -> std::io::Result<Self> {
        let id = id.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(format!("{id}-worker"))
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
            id,
        })
    }
}

impl Dispatcher for RuntimeDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn dispatch(
        &self,
        work: BoxFuture<'static, Result<(), TestError>>,
    ) -> BoxFuture<'static, Result<(), TestError>> {
        let task = AbortOnDropHandle::new(self.handle.spawn(work));
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(TestError::cancelled()),
                Err(e) => Err(TestError::new("panic", format!("task panicked: {e}"))),
            }
        }
        .boxed()
    }
}

impl Drop for RuntimeDispatcher {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which is not allowed inside async code.
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for RuntimeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDispatcher")
            .field("id", &self.id)
            .field("owned", &self.owned.is_some())
            .finish()
    }
}

/// Registered dispatchers, keyed by id.
#[derive(Clone, Default)]
pub(crate) struct Dispatchers {
    by_id: HashMap<String, Arc<dyn Dispatcher>>,
}

impl Dispatchers {
    pub fn insert(&mut self, dispatcher: Arc<dyn Dispatcher>) {
        self.by_id.insert(dispatcher.id().to_string(), dispatcher);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Run `work` through the dispatcher `affinity` names, with the current
    /// dispatcher identity set. Without an affinity the work runs inline.
    pub fn run(
        &self,
        affinity: Option<&str>,
        work: BoxFuture<'static, Result<(), TestError>>,
    ) -> BoxFuture<'static, Result<(), TestError>> {
        let Some(dispatcher) = affinity.and_then(|id| self.by_id.get(id)) else {
            return work;
        };
        let id: Arc<str> = Arc::from(dispatcher.id());
        dispatcher.dispatch(CURRENT_DISPATCHER.scope(id, work).boxed())
    }
}
