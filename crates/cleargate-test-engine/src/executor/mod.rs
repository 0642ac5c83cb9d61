//! Test executor: admits ready units through the scheduler and runs each
//! one inside its hook pipeline as a tokio task.
//!
//! The coordinator loop owns every piece of scheduling state; unit tasks
//! only touch the shared-instance manager and the scope tracker, both of
//! which are internally synchronized.

pub(crate) mod run;
mod unit;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::errors::ConfigError;
use crate::run_event::RunEvent;
use crate::scheduler::AdaptiveConfig;
use crate::types::RunSummary;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Static concurrency ceiling. Default: available parallelism.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Let a controller raise the ceiling while the machine is idle.
    #[serde(default)]
    pub adaptive: Option<AdaptiveConfig>,
    /// Timeout for test bodies that declare none.
    #[serde(default)]
    pub default_test_timeout_ms: Option<u64>,
    /// Timeout for hooks that declare none.
    #[serde(default)]
    pub default_hook_timeout_ms: Option<u64>,
    /// Capacity of the live event broadcast. Default: 1024.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Skip everything not yet started once a unit fails.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_max_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            adaptive: None,
            default_test_timeout_ms: None,
            default_hook_timeout_ms: None,
            event_channel_capacity: default_event_channel_capacity(),
            fail_fast: false,
        }
    }
}

impl ExecutorConfig {
    pub const ENV_MAX_PARALLEL: &'static str = "CLEARGATE_TEST_MAX_PARALLEL";
    pub const ENV_TIMEOUT_MS: &'static str = "CLEARGATE_TEST_TIMEOUT_MS";
    pub const ENV_HOOK_TIMEOUT_MS: &'static str = "CLEARGATE_TEST_HOOK_TIMEOUT_MS";
    pub const ENV_FAIL_FAST: &'static str = "CLEARGATE_TEST_FAIL_FAST";
    pub const ENV_ADAPTIVE: &'static str = "CLEARGATE_TEST_ADAPTIVE";

    /// Defaults overridden by whichever `CLEARGATE_TEST_*` variables are
    /// set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(Self::ENV_MAX_PARALLEL) {
            let value: usize = parse(Self::ENV_MAX_PARALLEL, &raw)?;
            if value == 0 {
                return Err(invalid(Self::ENV_MAX_PARALLEL, &raw, "must be at least 1"));
            }
            config.max_parallelism = value;
        }
        if let Some(raw) = lookup(Self::ENV_TIMEOUT_MS) {
            config.default_test_timeout_ms = Some(parse(Self::ENV_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(Self::ENV_HOOK_TIMEOUT_MS) {
            config.default_hook_timeout_ms = Some(parse(Self::ENV_HOOK_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(Self::ENV_FAIL_FAST) {
            config.fail_fast = parse_flag(Self::ENV_FAIL_FAST, &raw)?;
        }
        if let Some(raw) = lookup(Self::ENV_ADAPTIVE) {
            if parse_flag(Self::ENV_ADAPTIVE, &raw)? {
                config.adaptive = Some(AdaptiveConfig::default());
            }
        }
        Ok(config)
    }

    pub fn test_timeout(&self) -> Option<Duration> {
        self.default_test_timeout_ms.map(Duration::from_millis)
    }

    pub fn hook_timeout(&self) -> Option<Duration> {
        self.default_hook_timeout_ms.map(Duration::from_millis)
    }
}

fn invalid(var: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(var: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, raw, e.to_string()))
}

fn parse_flag(var: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(var, raw, "expected true or false")),
    }
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Handle to a running execution.
///
/// Dropping the handle cancels the run.
pub struct ExecutionHandle {
    /// Unique identifier for this run.
    pub run_id: String,
    /// Broadcast receiver for live run events.
    pub events: broadcast::Receiver<RunEvent>,
    pub(crate) cancel: Option<oneshot::Sender<()>>,
    pub(crate) completion: JoinHandle<RunSummary>,
}

impl ExecutionHandle {
    /// Ask the run to stop. In-flight bodies and hooks see their
    /// cancellation tokens fire; units not yet started are reported as
    /// cancelled. After hooks of started scopes still run.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunSummary, tokio::task::JoinError> {
        let Self {
            cancel, completion, ..
        } = self;
        let summary = completion.await;
        drop(cancel);
        summary
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ExecutorConfig::from_lookup(lookup(&[
            (ExecutorConfig::ENV_MAX_PARALLEL, "3"),
            (ExecutorConfig::ENV_TIMEOUT_MS, "2500"),
            (ExecutorConfig::ENV_FAIL_FAST, "true"),
            (ExecutorConfig::ENV_ADAPTIVE, "1"),
        ]))
        .unwrap();
        assert_eq!(config.max_parallelism, 3);
        assert_eq!(config.test_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.hook_timeout(), None);
        assert!(config.fail_fast);
        assert_eq!(config.adaptive, Some(AdaptiveConfig::default()));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = ExecutorConfig::from_lookup(lookup(&[(ExecutorConfig::ENV_MAX_PARALLEL, "many")]))
            .unwrap_err();
        assert!(err.to_string().contains(ExecutorConfig::ENV_MAX_PARALLEL));

        assert!(
            ExecutorConfig::from_lookup(lookup(&[(ExecutorConfig::ENV_MAX_PARALLEL, "0")])).is_err()
        );
        assert!(
            ExecutorConfig::from_lookup(lookup(&[(ExecutorConfig::ENV_FAIL_FAST, "maybe")])).is_err()
        );
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"max_parallelism": 2, "adaptive": {}}"#).unwrap();
        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.event_channel_capacity, 1024);
        assert_eq!(config.adaptive.unwrap().sample_interval_ms, 500);
    }
}
