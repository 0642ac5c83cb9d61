//! In-memory reporter for tests and embedding.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::ReporterError;
use crate::run_event::RunEvent;
use crate::traits::Reporter;
use crate::types::TestResult;

/// Keeps every event it receives. Clones share the same buffer, so a
/// clone handed to the builder can be inspected after the run.
#[derive(Clone, Default)]
pub struct InMemoryReporter {
    events: Arc<RwLock<Vec<RunEvent>>>,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Results from `UnitCompleted` events, in completion order.
    pub fn results(&self) -> Vec<TestResult> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                RunEvent::UnitCompleted { result, .. } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.read().iter().map(RunEvent::kind).collect()
    }
}

#[async_trait]
impl Reporter for InMemoryReporter {
    async fn report(&self, event: &RunEvent) -> Result<(), ReporterError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}
