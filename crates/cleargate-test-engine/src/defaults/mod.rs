//! Built-in reporters and load probes.
//!
//! None of these are required; the engine runs with no reporter at all and
//! falls back to [`LoadAvgProbe`] when the adaptive ceiling is enabled.

pub mod file_reporter;
pub mod in_memory_reporter;
pub mod load_probe;
pub mod tracing_reporter;

pub use file_reporter::FileReporter;
pub use in_memory_reporter::InMemoryReporter;
pub use load_probe::{LoadAvgProbe, StaticLoadProbe};
pub use tracing_reporter::TracingReporter;
