//! Structured execution log — JSON lines per batch.
//!
//! Every ocloop invocation writes a `.jsonl` log file capturing the batch
//! lifecycle: server readiness, run starts and completions, dispatch
//! failures, view changes, and native handoffs. Each line is a
//! self-contained JSON object with a timestamp, making logs easy to grep,
//! stream, and post-process. This file is the single source of truth for
//! "why did the batch stop".

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

/// Timestamp as RFC 3339 string.
fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// The event type and its data.
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// The backend server reported its listening port.
    ServerReady { port: u16 },
    /// The backend server exited before becoming ready.
    ServerFailed { exit_code: Option<u32> },
    /// A new run was started against a fresh session.
    RunStarted { run_number: u32, session_id: String },
    /// The prompt was handed to the dispatch thread for a session.
    PromptDispatched { session_id: String },
    /// Prompt dispatch failed. The run may never settle on its own.
    DispatchFailed { session_id: String, error: String },
    /// Session creation failed; the run attempt was aborted.
    SessionCreateFailed { error: String },
    /// A run was observed idle and finalized.
    RunCompleted {
        run_number: u32,
        session_id: String,
        duration_ms: u64,
    },
    /// The user navigated to a different run.
    RunSelected { index: usize, session_id: String },
    /// The terminal was handed to a foreground attach process.
    NativeAttachStarted { session_id: String },
    /// The foreground attach process exited; the view resumed.
    NativeAttachEnded { session_id: String },
    /// The batch will start no further runs.
    BatchStopped { reason: String },
    /// The process is exiting.
    BatchEnded { runs_completed: usize },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
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
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Get the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
