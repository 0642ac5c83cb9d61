//! In-memory helpers for tests: an event recorder, recording fixtures and
//! concurrency probes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::traits::{Fixture, FixtureFactory};
use crate::types::{FixtureRequest, TestError};

/// Shared, ordered log of string events.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// Events with `prefix`, in order.
    pub fn filtered(&self, prefix: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Fixture that logs `init:`, `dispose:` and `dispose_async:` events.
pub struct RecordingFixture {
    pub name: String,
    pub serial: usize,
    pub nested: Vec<Arc<dyn Fixture>>,
    recorder: Recorder,
    fail_init: bool,
    disposed: AtomicBool,
}

impl RecordingFixture {
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fixture for RecordingFixture {
    async fn initialize(&self) -> Result<(), TestError> {
        tokio::task::yield_now().await;
        if self.fail_init {
            return Err(TestError::failure(format!("{} refused to start", self.name)));
        }
        self.recorder.push(format!("init:{}", self.name));
        Ok(())
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.recorder.push(format!("dispose:{}", self.name));
    }

    async fn dispose_async(&self) {
        self.recorder.push(format!("dispose_async:{}", self.name));
    }
}

/// Factory for [`RecordingFixture`]s that logs `create:` events.
pub struct RecordingFactory {
    name: String,
    recorder: Recorder,
    nested: Vec<FixtureRequest>,
    delay: Duration,
    fail_init: bool,
    serial: AtomicUsize,
}

impl RecordingFactory {
    pub fn new(name: impl Into<String>, recorder: Recorder) -> Self {
        Self {
            name: name.into(),
            recorder,
            nested: Vec::new(),
            delay: Duration::ZERO,
            fail_init: false,
            serial: AtomicUsize::new(0),
        }
    }

    pub fn with_nested(mut self, request: FixtureRequest) -> Self {
        self.nested.push(request);
        self
    }

    /// Sleep inside `create`, widening the window for racing acquirers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }
}

#[async_trait]
impl FixtureFactory for RecordingFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn nested(&self) -> Vec<FixtureRequest> {
        self.nested.clone()
    }

    async fn create(&self, nested: Vec<Arc<dyn Fixture>>) -> Result<Arc<dyn Fixture>, TestError> {
        self.recorder.push(format!("create:{}", self.name));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Arc::new(RecordingFixture {
            name: self.name.clone(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            nested,
            recorder: self.recorder.clone(),
            fail_init: self.fail_init,
            disposed: AtomicBool::new(false),
        }))
    }
}

/// Tracks how many callers are inside a section at once.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Execution intervals keyed by label.
#[derive(Clone, Default)]
pub struct Intervals {
    spans: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

impl Intervals {
    pub fn record(&self, label: impl Into<String>, start: Instant, end: Instant) {
        self.spans.lock().push((label.into(), start, end));
    }

    pub fn spans(&self) -> Vec<(String, Instant, Instant)> {
        self.spans.lock().clone()
    }

    /// Labels ordered by start time.
    pub fn start_order(&self) -> Vec<String> {
        let mut spans = self.spans();
        spans.sort_by_key(|(_, start, _)| *start);
        spans.into_iter().map(|(label, _, _)| label).collect()
    }

    /// Whether any two recorded intervals overlap.
    pub fn any_overlap(&self) -> bool {
        let mut spans = self.spans();
        spans.sort_by_key(|(_, start, _)| *start);
        let mut latest_end: Option<Instant> = None;
        for (_, start, end) in spans {
            if latest_end.is_some_and(|latest| start < latest) {
                return true;
            }
            latest_end = Some(latest_end.map_or(end, |latest| latest.max(end)));
        }
        false
    }
}

/// A passing unit with no data, for graph and scheduler tests.
pub fn bare_unit(class: &str, method: &str, seq: usize) -> crate::types::TestUnit {
    use crate::types::*;
    TestUnit {
        id: UnitId::new(format!("{class}.{method}")),
        seq,
        class: Arc::new(ClassDescriptor {
            name: class.to_string(),
            assembly: DEFAULT_ASSEMBLY.to_string(),
            base: None,
            affinity: None,
        }),
        method: method.to_string(),
        display_name: method.to_string(),
        class_args: Vec::new(),
        method_args: Vec::new(),
        dependencies: Vec::new(),
        constraint_keys: Vec::new(),
        group: None,
        limit: None,
        priority: Priority::default(),
        retry: RetryPolicy::default(),
        skip: None,
        timeout: None,
        affinity: None,
        repeat_index: 0,
        categories: Vec::new(),
        properties: Default::default(),
        instance: None,
        body: Arc::new(crate::traits::body_fn(|_| async { Ok(()) })),
        skip_when: None,
    }
}
