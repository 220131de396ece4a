//! Structured execution log — JSON lines per watch session.
//!
//! Every `keepgoing watch` session writes a `.jsonl` file capturing what the
//! watcher saw and did: prompt detections, probe results, escalation
//! decisions, visual attempts, clicks, fallbacks, and operator commands. Each
//! line is a self-contained JSON object with an RFC 3339 timestamp.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{Local, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::CONFIG_DIR;

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
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
    SessionStarted {
        host: String,
        config_path: Option<String>,
    },
    /// A recognizer matched host text.
    PromptDetected {
        pattern_index: usize,
        matched_text: String,
        source: String,
    },
    ProbeResult {
        resolved: bool,
        detail: String,
    },
    EscalationDecision {
        trigger: bool,
        reason: String,
        skip_reason: Option<String>,
    },
    VisualAttempt {
        succeeded: bool,
        target_found: bool,
        detail: String,
    },
    Click {
        x: i32,
        y: i32,
        method: String,
        succeeded: bool,
    },
    Fallback {
        outcome: String,
    },
    OperatorCommand {
        command: String,
    },
    SessionEnded {
        reason: String,
    },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
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
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }
}

/// A fresh session id: local start time plus a short random suffix.
pub fn new_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// `<root>/.keepgoing/logs/<session>.jsonl`
pub fn session_log_path(root: &Path, session: &str) -> PathBuf {
    root.join(CONFIG_DIR)
        .join("logs")
        .join(format!("{session}.jsonl"))
}
