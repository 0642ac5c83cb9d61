//! Terminal outcomes, per-unit results and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HookScope, HookTiming, UnitId};

/// Why a unit failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
#[non_exhaustive]
pub enum FailureKind {
    /// The test body returned an error.
    Body,
    /// A Before/After hook or event receiver failed.
    Hook { hook: String },
    /// The body exceeded its timeout.
    Timeout { after_ms: u64 },
    /// A fixture could not be created or initialized.
    Fixture,
    /// Nothing could be scheduled while this unit was still pending.
    Deadlock,
    /// The run was cancelled while the unit was in flight.
    Cancelled,
}

/// Terminal state of a unit. Every variant carries a readable reason except
/// `Passed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    Passed,
    Failed { kind: FailureKind, reason: String },
    Skipped { reason: String },
}

impl Outcome {
    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Outcome::Failed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Passed => None,
            Outcome::Failed { reason, .. } | Outcome::Skipped { reason } => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed { .. } => "failed",
            Outcome::Skipped { .. } => "skipped",
        }
    }
}

/// A hook (or receiver) failure, reported separately from body failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailureRecord {
    pub hook: String,
    pub scope: HookScope,
    pub timing: HookTiming,
    /// Unit id, class, assembly or `session`.
    pub target: String,
    pub message: String,
    pub timed_out: bool,
    /// Whether the failure failed its scope.
    pub fatal: bool,
}

/// Final record for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub unit_id: UnitId,
    pub class: String,
    pub method: String,
    pub display_name: String,
    pub outcome: Outcome,
    /// Executions of the body, including retries. 0 when never started.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<HookFailureRecord>,
    /// Text written through the test context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// A dependency of a unit, as exposed to that unit's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub unit_id: UnitId,
    pub class: String,
    pub method: String,
    pub display_name: String,
    /// `None` while the dependency has not reached a terminal state.
    pub outcome: Option<Outcome>,
    /// Declared directly rather than reached transitively.
    pub direct: bool,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// Results in plan order.
    pub results: Vec<TestResult>,
    /// Failures of class, assembly and session hooks.
    pub hook_failures: Vec<HookFailureRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_skipped()).count()
    }

    pub fn result(&self, unit_id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.unit_id.as_str() == unit_id)
    }

    /// Every variant of `class.method`.
    pub fn results_for(&self, class: &str, method: &str) -> Vec<&TestResult> {
        self.results
            .iter()
            .filter(|r| r.class == class && r.method == method)
            .collect()
    }
}
