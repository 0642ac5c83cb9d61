//! Run event stream.
//!
//! Every variant carries a monotonic `seq` (assigned by the [`EventSink`])
//! and a `schema_version` for forward-compatible deserialization.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

use crate::traits::Reporter;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event_type")]
#[non_exhaustive]
pub enum RunEvent {
    RunStarted {
        seq: u64,
        schema_version: u16,
        run_id: String,
        total_units: usize,
        max_parallelism: usize,
        timestamp: DateTime<Utc>,
    },
    UnitStarted {
        seq: u64,
        schema_version: u16,
        run_id: String,
        unit_id: UnitId,
        display_name: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    UnitRetrying {
        seq: u64,
        schema_version: u16,
        run_id: String,
        unit_id: UnitId,
        /// The attempt that failed.
        attempt: u32,
        error: String,
        backoff_ms: u64,
        timestamp: DateTime<Utc>,
    },
    UnitCompleted {
        seq: u64,
        schema_version: u16,
        run_id: String,
        result: TestResult,
        timestamp: DateTime<Utc>,
    },
    HookCompleted {
        seq: u64,
        schema_version: u16,
        run_id: String,
        hook: String,
        scope: HookScope,
        timing: HookTiming,
        target: String,
        status: HookStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        seq: u64,
        schema_version: u16,
        run_id: String,
        status: RunStatus,
        passed: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::RunStarted { seq, .. }
            | Self::UnitStarted { seq, .. }
            | Self::UnitRetrying { seq, .. }
            | Self::UnitCompleted { seq, .. }
            | Self::HookCompleted { seq, .. }
            | Self::RunCompleted { seq, .. } => *seq,
        }
    }

    pub fn set_seq(&mut self, new_seq: u64) {
        match self {
            Self::RunStarted { seq, .. }
            | Self::UnitStarted { seq, .. }
            | Self::UnitRetrying { seq, .. }
            | Self::UnitCompleted { seq, .. }
            | Self::HookCompleted { seq, .. }
            | Self::RunCompleted { seq, .. } => *seq = new_seq,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::UnitStarted { run_id, .. }
            | Self::UnitRetrying { run_id, .. }
            | Self::UnitCompleted { run_id, .. }
            | Self::HookCompleted { run_id, .. }
            | Self::RunCompleted { run_id, .. } => run_id,
        }
    }

    /// Short variant name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::UnitStarted { .. } => "unit_started",
            Self::UnitRetrying { .. } => "unit_retrying",
            Self::UnitCompleted { .. } => "unit_completed",
            Self::HookCompleted { .. } => "hook_completed",
            Self::RunCompleted { .. } => "run_completed",
        }
    }
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

struct SinkInner {
    run_id: String,
    seq: AtomicU64,
    tx: broadcast::Sender<RunEvent>,
    reporters: Vec<Arc<dyn Reporter>>,
    /// Serializes sequencing and delivery so reporters see `seq` order.
    delivery: Mutex<()>,
}

/// Numbers events, broadcasts them and hands them to every reporter.
#[derive(Clone)]
pub(crate) struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    pub fn new(
        run_id: String,
        tx: broadcast::Sender<RunEvent>,
        reporters: Vec<Arc<dyn Reporter>>,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                run_id,
                seq: AtomicU64::new(0),
                tx,
                reporters,
                delivery: Mutex::new(()),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub async fn emit(&self, mut event: RunEvent) {
        let _guard = self.inner.delivery.lock().await;
        event.set_seq(self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1);
        // No subscribers is fine.
        let _ = self.inner.tx.send(event.clone());
        for reporter in &self.inner.reporters {
            if let Err(e) = reporter.report(&event).await {
                tracing::warn!(
                    run_id = %self.inner.run_id,
                    event = event.kind(),
                    error = %e,
                    "reporter failed"
                );
            }
        }
    }

    pub async fn flush(&self) {
        let _guard = self.inner.delivery.lock().await;
        for reporter in &self.inner.reporters {
            if let Err(e) = reporter.flush().await {
                tracing::warn!(run_id = %self.inner.run_id, error = %e, "reporter flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::errors::ReporterError;

    fn started(run_id: &str) -> RunEvent {
        RunEvent::RunStarted {
            seq: 0,
            schema_version: RUN_EVENT_SCHEMA_VERSION,
            run_id: run_id.into(),
            total_units: 3,
            max_parallelism: 2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn serializes_with_event_type_tag() {
        let value = serde_json::to_value(started("r1")).unwrap();
        assert_eq!(value["event_type"], json!("run_started"));
        assert_eq!(value["total_units"], json!(3));

        let back: RunEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.run_id(), "r1");
    }

    struct Failing;

    #[async_trait]
    impl Reporter for Failing {
        async fn report(&self, _event: &RunEvent) -> Result<(), ReporterError> {
            Err(ReporterError::Reporter {
                message: "down".into(),
            })
        }
    }

    #[tokio::test]
    async fn sink_numbers_events_and_survives_reporter_errors() {
        let (tx, mut rx) = broadcast::channel(16);
        let sink = EventSink::new("r1".into(), tx, vec![Arc::new(Failing)]);
        sink.emit(started("r1")).await;
        sink.emit(started("r1")).await;
        sink.flush().await;

        assert_eq!(rx.recv().await.unwrap().seq(), 1);
        assert_eq!(rx.recv().await.unwrap().seq(), 2);
    }
}
