//! File-system reporter writing JSONL event files.
//!
//! Layout:
//! ```text
//! {base_dir}/runs/{run_id}/events.jsonl
//! ```
//!
//! Each line is a JSON-serialized [`RunEvent`], appended in sequence order.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::ReporterError;
use crate::run_event::RunEvent;
use crate::traits::Reporter;

pub struct FileReporter {
    base_dir: PathBuf,
    writers: Mutex<HashMap<String, BufWriter<File>>>,
}

impl FileReporter {
    /// Create a reporter rooted at `base_dir`, creating `{base_dir}/runs/`
    /// if it doesn't exist.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, ReporterError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("runs"))?;
        Ok(Self {
            base_dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join("runs").join(run_id).join("events.jsonl")
    }

    /// Read back the events of a run, ordered by seq.
    pub fn read_events(&self, run_id: &str) -> Result<Vec<RunEvent>, ReporterError> {
        read_events(&self.events_path(run_id))
    }

    fn open(&self, run_id: &str) -> Result<BufWriter<File>, ReporterError> {
        let path = self.events_path(run_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }
}

fn read_events(path: &Path) -> Result<Vec<RunEvent>, ReporterError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str::<RunEvent>(line)?);
    }
    events.sort_by_key(RunEvent::seq);
    Ok(events)
}

#[async_trait]
impl Reporter for FileReporter {
    async fn report(&self, event: &RunEvent) -> Result<(), ReporterError> {
        let line = serde_json::to_string(event)?;
        let mut writers = self.writers.lock();
        let writer = match writers.entry(event.run_id().to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(self.open(event.run_id())?),
        };
        writeln!(writer, "{line}")?;
        if matches!(event, RunEvent::RunCompleted { .. }) {
            writer.flush()?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ReporterError> {
        let mut writers = self.writers.lock();
        for (_, mut writer) in writers.drain() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{RUN_EVENT_SCHEMA_VERSION, RunStatus};

    fn completed(run_id: &str) -> RunEvent {
        RunEvent::RunCompleted {
            seq: 2,
            schema_version: RUN_EVENT_SCHEMA_VERSION,
            run_id: run_id.into(),
            status: RunStatus::Completed,
            passed: 1,
            failed: 0,
            skipped: 0,
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    fn started(run_id: &str) -> RunEvent {
        RunEvent::RunStarted {
            seq: 1,
            schema_version: RUN_EVENT_SCHEMA_VERSION,
            run_id: run_id.into(),
            total_units: 1,
            max_parallelism: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileReporter::new(dir.path()).unwrap();
        reporter.report(&started("r1")).await.unwrap();
        reporter.report(&completed("r1")).await.unwrap();
        reporter.flush().await.unwrap();

        let events = reporter.read_events("r1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "run_started");
        assert_eq!(events[1].kind(), "run_completed");

        let raw = std::fs::read_to_string(reporter.events_path("r1")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn runs_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileReporter::new(dir.path()).unwrap();
        reporter.report(&started("a")).await.unwrap();
        reporter.report(&started("b")).await.unwrap();
        reporter.flush().await.unwrap();

        assert_eq!(reporter.read_events("a").unwrap().len(), 1);
        assert_eq!(reporter.read_events("b").unwrap().len(), 1);
        assert!(reporter.read_events("missing").unwrap().is_empty());
    }
}
