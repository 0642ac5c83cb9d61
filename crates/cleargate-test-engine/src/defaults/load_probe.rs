//! CPU signals for the adaptive concurrency ceiling.

use std::path::PathBuf;

use crate::traits::LoadProbe;

/// Reads the one-minute load average from `/proc/loadavg` and scales it by
/// the number of available cores. Reports `None` where the file does not
/// exist, which keeps the ceiling at its static count.
pub struct LoadAvgProbe {
    path: PathBuf,
    cores: usize,
}

impl LoadAvgProbe {
    pub fn new() -> Self {
        Self::with_path("/proc/loadavg")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Default for LoadAvgProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

impl LoadProbe for LoadAvgProbe {
    fn cpu_percent(&self) -> Option<f64> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let load = parse_loadavg(&raw)?;
        Some((load / self.cores as f64 * 100.0).clamp(0.0, 100.0))
    }
}

/// Always reports the same reading.
#[derive(Debug, Clone, Copy)]
pub struct StaticLoadProbe(Option<f64>);

impl StaticLoadProbe {
    pub fn new(percent: Option<f64>) -> Self {
        Self(percent)
    }
}

impl LoadProbe for StaticLoadProbe {
    fn cpu_percent(&self) -> Option<f64> {
        self.0
    }
}
