//! Event logging for the build orchestrator.
//!
//! An append-only JSONL event log keyed to jobs and deployments.
//!
//! # Example
//!
//! ```
//! use circuit_events::{BuildEvent, EventLog};
//! use chrono::Utc;
//!
//! let mut log = EventLog::new();
//! log.record(BuildEvent {
//!     timestamp: Utc::now(),
//!     job_id: "job-1".to_string(),
//!     kind: circuit_events::EventKind::JobQueued { priority: 0 },
//! });
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = "build-events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One lifecycle transition observed during a build attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    JobQueued { priority: i32 },
    JobClaimed { worker_id: String },
    FetchStarted,
    FetchCompleted { bytes: u64 },
    CompileProgress { progress: u8, message: String },
    CompileCompleted { files: usize, success: bool },
    ArtifactsPersisted { count: usize },
    ProviderNotified { capability: String, ok: bool },
    JobRetried { retry_count: u32, backoff_ms: u64 },
    JobFailed { message: String },
    JobCompleted,
    LeaseReclaimed { previous_worker_id: String },
}

/// A single recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only in-memory event buffer, flushed to a JSONL file.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BuildEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: BuildEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to `path` in JSONL format.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("failed to read events line")?;
            if line.trim().is_empty() {
                continue;
            }
            let event: BuildEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event line: {line}"))?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn events_for_job(&self, job_id: &str) -> Vec<&BuildEvent> {
        self.events.iter().filter(|e| e.job_id == job_id).collect()
    }

    pub fn all_events(&self) -> &[BuildEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drops buffered events after a flush, so the buffer only ever holds
    /// events from the in-progress attempt.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
