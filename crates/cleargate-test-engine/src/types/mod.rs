//! Core data types for the test engine.
//!
//! A [`TestTemplate`] is what callers register; the expander turns each
//! template into one or more [`TestUnit`]s, which are what the scheduler
//! dispatches and what results are reported against.

mod data;
mod hooks;
mod outcome;
mod unit;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::traits::RetryCondition;

pub use data::*;
pub use hooks::*;
pub use outcome::*;
pub use unit::*;

/// Schema version stamped on every [`RunEvent`](crate::run_event::RunEvent).
pub const RUN_EVENT_SCHEMA_VERSION: u16 = 1;

/// Assembly used for classes that never declare one.
pub const DEFAULT_ASSEMBLY: &str = "default";

// ---------------------------------------------------------------------------
// TestError
// ---------------------------------------------------------------------------

/// Failure raised by a test body, hook or event receiver.
///
/// `kind` plays the role of an exception type: retry predicates and reports
/// match on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestError {
    pub kind: String,
    pub message: String,
}

impl TestError {
    /// Kind used by [`TestError::skip`].
    pub const SKIP: &'static str = "skip";
    /// Kind used when a timeout fires.
    pub const TIMEOUT: &'static str = "timeout";
    /// Kind used when the run is cancelled underneath a body or hook.
    pub const CANCELLED: &'static str = "cancelled";
    /// Kind used by [`TestError::failure`].
    pub const FAILURE: &'static str = "failure";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Generic failure with no more specific kind.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(Self::FAILURE, message)
    }

    /// Skip the current test from inside its body.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::new(Self::SKIP, reason)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            Self::TIMEOUT,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "cancelled")
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn is_skip(&self) -> bool {
        self.is(Self::SKIP)
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TestError {}

impl From<String> for TestError {
    fn from(message: String) -> Self {
        Self::failure(message)
    }
}

impl From<&str> for TestError {
    fn from(message: &str) -> Self {
        Self::failure(message)
    }
}

// ---------------------------------------------------------------------------
// Scheduling attributes
// ---------------------------------------------------------------------------

/// Dispatch priority. Higher priorities are admitted first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Named mutual-exclusion tag. Units sharing a key never overlap; those with
/// an explicit order start in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstraintKey {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

impl ConstraintKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: None,
        }
    }

    pub fn ordered(name: impl Into<String>, order: i32) -> Self {
        Self {
            name: name.into(),
            order: Some(order),
        }
    }
}

/// Named partition. Only one partition runs at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParallelGroup(pub String);

impl ParallelGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Concurrency cap shared by every unit naming the same limiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelLimit {
    pub name: String,
    pub limit: usize,
}

impl ParallelLimit {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit: limit.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How a failing unit is re-executed.
///
/// A unit runs at most `max_retries + 1` times. Each retry re-runs the
/// Before(Test) hooks, the body and the After(Test) hooks.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry. Default: 0.
    pub backoff_ms: u64,
    /// Multiplier applied per further retry. Default: 1.0.
    pub backoff_multiplier: f64,
    /// Consulted with the failure and the attempt that produced it. When
    /// absent every failure is retried.
    pub condition: Option<Arc<dyn RetryCondition>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
            backoff_multiplier: 1.0,
            condition: None,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff_ms", &self.backoff_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff_ms: u64, multiplier: f64) -> Self {
        self.backoff_ms = backoff_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Only retry failures accepted by `condition`.
    pub fn when(mut self, condition: impl RetryCondition + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether `attempt` (1-based) failing with `error` earns another attempt.
    pub fn should_retry(&self, error: &TestError, attempt: u32) -> bool {
        if error.is_skip() || attempt >= self.max_attempts() {
            return false;
        }
        match &self.condition {
            Some(condition) => condition.should_retry(error, attempt),
            None => true,
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}
