//! Structured execution log: JSON lines per run.
//!
//! Every `autorun run` appends its events to a `.jsonl` file: option patch,
//! launch, navigation, trigger, observed status, crash or timeout, cleanup
//! and the final verdict. Each line is a self-contained JSON object carrying
//! an RFC 3339 timestamp and the run id, so several runs can share one file
//! and still be told apart with `grep` or `jq`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::options::PatchOutcome;
use crate::status::StatusState;
use crate::supervisor::RunState;
use crate::verdict::TestVerdict;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        program: String,
        log_path: String,
        result_path: String,
        completion_timeout_ms: u64,
    },
    OptionPatched {
        path: String,
        key: String,
        value: String,
        outcome: PatchOutcome,
    },
    AutLaunched {
        pid: u32,
        program: String,
        args: Vec<String>,
    },
    NavigationCompleted {
        steps: usize,
    },
    TriggerSent {
        command: String,
    },
    /// The status tracker settled on PASS or FAIL.
    StatusObserved {
        state: StatusState,
        elapsed_ms: u64,
    },
    CrashDetected {
        exit_code: Option<i32>,
    },
    TimedOut {
        timeout_ms: u64,
    },
    QuitRequested {
        command: String,
    },
    CleanupCompleted {
        run_state: Option<RunState>,
        daemons_killed: usize,
    },
    VerdictWritten {
        verdict: TestVerdict,
        path: String,
        persisted: bool,
    },
    RunFinished {
        verdict: TestVerdict,
        reason: String,
        duration_ms: u64,
    },
}

/// Writer for the JSON lines execution log of one run.
pub struct RunLog {
    run_id: String,
    writer: Option<Mutex<BufWriter<File>>>,
}

impl RunLog {
    /// Open the log at `path` for appending under a fresh run id.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory: {}", parent.display())
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            writer: Some(Mutex::new(BufWriter::new(file))),
        })
    }

    /// A log that records nothing. Used when the file cannot be opened.
    pub fn disabled() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            writer: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let entry = LogEntry {
            timestamp: now_rfc3339(),
            run_id: self.run_id.clone(),
            event,
        };
        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Append an event; a failed write is reported and otherwise ignored.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(error = %e, "failed to write execution log entry");
        }
    }
}
