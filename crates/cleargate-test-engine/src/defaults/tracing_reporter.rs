//! Reporter that turns run events into `tracing` spans and events.
//!
//! Each unit gets one `test_unit` span, opened on its first start and closed
//! when its result arrives. Retries and hook results are events; hook events
//! for a test land inside that test's span.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::ReporterError;
use crate::run_event::{HookStatus, RunEvent};
use crate::traits::Reporter;
use crate::types::{HookScope, Outcome};

#[derive(Default)]
pub struct TracingReporter {
    spans: Mutex<HashMap<String, tracing::Span>>,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_unit_span(&self, unit_id: &str, f: impl FnOnce()) {
        match self.spans.lock().get(unit_id) {
            Some(span) => span.in_scope(f),
            None => f(),
        }
    }
}

#[async_trait]
impl Reporter for TracingReporter {
    async fn report(&self, event: &RunEvent) -> Result<(), ReporterError> {
        match event {
            RunEvent::RunStarted {
                run_id,
                total_units,
                max_parallelism,
                ..
            } => {
                tracing::info!(%run_id, total_units, max_parallelism, "run started");
            }
            RunEvent::UnitStarted {
                run_id,
                unit_id,
                display_name,
                attempt,
                ..
            } => {
                let span = self
                    .spans
                    .lock()
                    .entry(unit_id.to_string())
                    .or_insert_with(|| {
                        tracing::info_span!(
                            "test_unit",
                            %run_id,
                            %unit_id,
                            %display_name,
                        )
                    })
                    .clone();
                span.in_scope(|| tracing::debug!(attempt, "attempt started"));
            }
            RunEvent::UnitRetrying {
                unit_id,
                attempt,
                error,
                backoff_ms,
                ..
            } => self.in_unit_span(unit_id.as_str(), || {
                tracing::warn!(attempt, %error, backoff_ms, "retrying");
            }),
            RunEvent::HookCompleted {
                hook,
                scope,
                timing,
                target,
                status,
                duration_ms,
                message,
                ..
            } => {
                let log = || match status {
                    HookStatus::Passed => {
                        tracing::debug!(%hook, %scope, ?timing, %target, duration_ms, "hook passed")
                    }
                    HookStatus::Skipped => {
                        tracing::debug!(%hook, %scope, ?timing, %target, reason = ?message, "hook skipped")
                    }
                    HookStatus::Failed | HookStatus::TimedOut => tracing::warn!(
                        %hook,
                        %scope,
                        ?timing,
                        %target,
                        ?status,
                        error = ?message,
                        "hook failed"
                    ),
                };
                if *scope == HookScope::Test {
                    self.in_unit_span(target, log);
                } else {
                    log();
                }
            }
            RunEvent::UnitCompleted { result, .. } => {
                let span = self.spans.lock().remove(result.unit_id.as_str());
                let log = || match &result.outcome {
                    Outcome::Passed => {
                        tracing::info!(attempts = result.attempts, duration_ms = result.duration_ms, "test passed")
                    }
                    Outcome::Skipped { reason } => tracing::info!(%reason, "test skipped"),
                    Outcome::Failed { kind, reason } => tracing::error!(
                        attempts = result.attempts,
                        ?kind,
                        %reason,
                        "test failed"
                    ),
                };
                match span {
                    Some(span) => span.in_scope(log),
                    None => log(),
                }
            }
            RunEvent::RunCompleted {
                run_id,
                status,
                passed,
                failed,
                skipped,
                duration_ms,
                ..
            } => {
                self.spans.lock().clear();
                tracing::info!(
                    %run_id,
                    ?status,
                    passed,
                    failed,
                    skipped,
                    duration_ms,
                    "run completed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{RUN_EVENT_SCHEMA_VERSION, TestResult, UnitId};

    #[tokio::test]
    async fn unit_span_lives_until_the_result() {
        let reporter = TracingReporter::new();
        reporter
            .report(&RunEvent::UnitStarted {
                seq: 1,
                schema_version: RUN_EVENT_SCHEMA_VERSION,
                run_id: "r".into(),
                unit_id: UnitId::new("C.a"),
                display_name: "a".into(),
                attempt: 1,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(reporter.spans.lock().len(), 1);

        let result = TestResult {
            unit_id: UnitId::new("C.a"),
            class: "C".into(),
            method: "a".into(),
            display_name: "a".into(),
            outcome: Outcome::Passed,
            attempts: 1,
            started_at: None,
            completed_at: Utc::now(),
            duration_ms: 0,
            hook_failures: Vec::new(),
            output: String::new(),
        };
        reporter
            .report(&RunEvent::UnitCompleted {
                seq: 2,
                schema_version: RUN_EVENT_SCHEMA_VERSION,
                run_id: "r".into(),
                result,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        assert!(reporter.spans.lock().is_empty());
    }
}
