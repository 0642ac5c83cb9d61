//! Adaptive concurrency ceiling.
//!
//! A controller task samples a [`LoadProbe`] and publishes the ceiling on a
//! `watch` channel. The ceiling never drops below the static count, and the
//! scheduler treats it as a soft bound beneath key, group and limiter rules.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::traits::LoadProbe;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Upper bound for the ceiling. `None` means four times the static
    /// count.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Below this CPU percentage the ceiling grows.
    #[serde(default = "default_raise_below")]
    pub raise_below: f64,
    /// Below this CPU percentage growth is tripled.
    #[serde(default = "default_boost_below")]
    pub boost_below: f64,
    /// Above this CPU percentage the ceiling falls back to the static count.
    #[serde(default = "default_saturated_above")]
    pub saturated_above: f64,
}

fn default_sample_interval_ms() -> u64 {
    500
}

fn default_raise_below() -> f64 {
    70.0
}

fn default_boost_below() -> f64 {
    10.0
}

fn default_saturated_above() -> f64 {
    90.0
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_parallelism: None,
            sample_interval_ms: default_sample_interval_ms(),
            raise_below: default_raise_below(),
            boost_below: default_boost_below(),
            saturated_above: default_saturated_above(),
        }
    }
}

/// Pure ceiling policy, separated from the sampling loop.
#[derive(Debug, Clone)]
pub struct AdaptiveCeiling {
    static_count: usize,
    max: usize,
    config: AdaptiveConfig,
}

impl AdaptiveCeiling {
    pub fn new(static_count: usize, config: AdaptiveConfig) -> Self {
        let static_count = static_count.max(1);
        let max = config
            .max_parallelism
            .unwrap_or(static_count * 4)
            .max(static_count);
        Self {
            static_count,
            max,
            config,
        }
    }

    pub fn static_count(&self) -> usize {
        self.static_count
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Next ceiling given the current one and a CPU sample.
    pub fn next(&self, current: usize, cpu: Option<f64>) -> usize {
        let Some(cpu) = cpu else {
            return current.clamp(self.static_count, self.max);
        };
        let next = if cpu > self.config.saturated_above {
            self.static_count
        } else if cpu < self.config.raise_below {
            let step = (current / 4).max(1);
            let step = if cpu < self.config.boost_below {
                step * 3
            } else {
                step
            };
            current.saturating_add(step)
        } else {
            current
        };
        next.clamp(self.static_count, self.max)
    }
}

/// Sample `probe` every interval until `cancel` fires, publishing changes
/// on `ceiling`.
pub(crate) fn spawn_controller(
    policy: AdaptiveCeiling,
    probe: Arc<dyn LoadProbe>,
    ceiling: watch::Sender<usize>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = Duration::from_millis(policy.config.sample_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let current = *ceiling.borrow();
                    let next = policy.next(current, probe.cpu_percent());
                    if next != current {
                        tracing::debug!(from = current, to = next, "adaptive ceiling changed");
                        if ceiling.send(next).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    })
}
