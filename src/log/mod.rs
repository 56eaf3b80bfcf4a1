//! Structured run log: JSON lines per first run.
//!
//! Every supervised run writes a `.jsonl` file under the install root
//! capturing launches, child output, readiness transitions, teardown, and
//! the final outcome. Each line is a self-contained JSON object with an
//! RFC 3339 timestamp and the run id.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::supervisor::{Outcome, SupervisorEvent};

/// A structured event in the run log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the run log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        install_root: String,
        base: String,
        deadline_secs: u64,
    },
    /// Artifact was already there; nothing was launched.
    AlreadyInitialized { artifact: String },
    ProcessLaunched {
        pid: u32,
        command: String,
        work_dir: String,
    },
    LaunchFailed { reason: String },
    /// Output line from the supervised process.
    ChildOutput { line: String },
    ReadinessDetected { marker: String },
    Quiescent { quiet_secs: f64 },
    VerificationReset { attempt: u32 },
    ShutdownStarted { outcome: Outcome, reason: String },
    TreeTerminated {
        root: u32,
        descendants: usize,
        forced: usize,
        failures: usize,
    },
    RunFinished {
        outcome: Outcome,
        message: String,
        elapsed_secs: f64,
    },
}

impl From<&SupervisorEvent> for LogEvent {
    fn from(event: &SupervisorEvent) -> Self {
        match event {
            SupervisorEvent::Output(line) => LogEvent::ChildOutput { line: line.clone() },
            SupervisorEvent::ReadinessDetected { marker } => LogEvent::ReadinessDetected {
                marker: marker.clone(),
            },
            SupervisorEvent::Quiescent { quiet_for } => LogEvent::Quiescent {
                quiet_secs: quiet_for.as_secs_f64(),
            },
            SupervisorEvent::VerificationReset { attempt } => {
                LogEvent::VerificationReset { attempt: *attempt }
            }
            SupervisorEvent::ShutdownStarted { outcome, reason } => LogEvent::ShutdownStarted {
                outcome: *outcome,
                reason: reason.clone(),
            },
            SupervisorEvent::TreeTerminated(report) => LogEvent::TreeTerminated {
                root: report.root,
                descendants: report.descendants.len(),
                forced: report.forced(),
                failures: report.failures(),
            },
            SupervisorEvent::Finished {
                outcome,
                message,
                elapsed,
            } => LogEvent::RunFinished {
                outcome: *outcome,
                message: message.clone(),
                elapsed_secs: elapsed.as_secs_f64(),
            },
        }
    }
}

/// File name for a run started at `at`.
pub fn log_file_name(at: DateTime<Utc>) -> String {
    format!("first-run-{}.jsonl", at.format("%Y%m%dT%H%M%SZ"))
}

/// Writer for JSON lines run logs.
pub struct RunLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
    run_id: Uuid,
}

impl RunLog {
    /// Create a run log at `path`, creating parent directories. Appends to an
    /// existing file.
    pub fn new(path: &Path, run_id: Uuid) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
            run_id,
        })
    }

    /// Open a fresh log in `dir`, named after the current time.
    pub fn create_in(dir: &Path, run_id: Uuid) -> Result<Self> {
        Self::new(&dir.join(log_file_name(Utc::now())), run_id)
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            run_id: self.run_id,
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "run log");

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}
