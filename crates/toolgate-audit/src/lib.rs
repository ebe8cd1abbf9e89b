#![warn(missing_docs)]

//! # toolgate-audit
//!
//! Tamper-evident audit trail for the toolgate gateway.
//!
//! Every gateway decision (tool call, rate limit, circuit rejection, auth
//! failure, shutdown) emits an [`AuditEvent`] appended as one JSON line to a
//! daily log file under `<state-dir>/audit-logs/`. Argument payloads are
//! never stored, only their SHA-256 hashes. A retention sweep deletes files
//! older than the configured window.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Errors from the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The log directory could not be created.
    #[error("failed to create audit log directory {dir}: {source}")]
    CreateDir {
        /// The directory that could not be created.
        dir: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An append failed.
    #[error("failed to append audit record: {0}")]
    Append(#[from] std::io::Error),

    /// An event could not be serialized.
    #[error("failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum AuditKind {
    /// A tool call reached the dispatcher.
    ToolCall,
    /// Arguments failed schema validation.
    ValidationFailed,
    /// A client was rate limited.
    RateLimited,
    /// A call was rejected by an open circuit.
    CircuitOpen,
    /// The admission queue rejected a call.
    QueueFull,
    /// A bridge request presented an invalid bearer token.
    AuthFailure,
    /// Downstream capability discovery.
    Discovery,
    /// The server began or finished draining.
    Shutdown,
}

/// The outcome of an audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The operation was recorded before its outcome is known.
    Pending,
    /// The operation succeeded.
    Success,
    /// The operation was attempted and failed.
    Failure,
    /// The operation was refused before any downstream work.
    Rejected,
}

/// One line of the audit log.
///
/// Serialization is deterministic: optional fields are omitted when absent
/// and the metadata map is ordered (`BTreeMap`), so re-encoding a decoded
/// record reproduces the original bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// UTC timestamp of the event.
    pub timestamp: DateTime<Utc>,
    /// Correlation id tying the event to one Execution.
    pub correlation_id: String,
    /// Event kind.
    pub kind: AuditKind,
    /// Event outcome.
    pub outcome: AuditOutcome,
    /// Fully-qualified tool name, when the event concerns one tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// SHA-256 hex of the request argument payload. Arguments are never
    /// stored raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_sha256: Option<String>,
    /// Latency of the operation in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Sanitized error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Arbitrary additional context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    /// Create an event with the given kind and outcome, stamped now.
    pub fn new(kind: AuditKind, outcome: AuditOutcome, correlation_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            kind,
            outcome,
            tool_name: None,
            args_sha256: None,
            latency_ms: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }

    /// Attach the SHA-256 of the serialized arguments.
    pub fn with_args_hash(mut self, args: &serde_json::Value) -> Self {
        self.args_sha256 = Some(sha256_hex(&args.to_string()));
        self
    }

    /// Attach a latency measurement.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Attach a sanitized error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let result = hasher.finalize();
    hex_encode(&result)
}

/// Encode bytes as a hex string.
fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

struct DayWriter {
    date: NaiveDate,
    file: tokio::fs::File,
}

/// Append-only, daily-rotated JSONL audit log.
///
/// All appends are serialized through a single writer mutex; the file handle
/// is reacquired after a UTC date rollover, so an earlier-dated record is
/// never appended after a later-dated file has been opened.
pub struct AuditLog {
    dir: PathBuf,
    retention_days: u32,
    writer: Mutex<Option<DayWriter>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("dir", &self.dir)
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open (creating if needed) the audit log directory under `state_dir`.
    ///
    /// Fatal if the directory cannot be created.
    pub fn open(state_dir: &Path, retention_days: u32) -> Result<Self, AuditError> {
        let dir = state_dir.join("audit-logs");
        std::fs::create_dir_all(&dir).map_err(|source| AuditError::CreateDir {
            dir: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            retention_days: retention_days.clamp(1, 365),
            writer: Mutex::new(None),
        })
    }

    /// The directory holding the daily log files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one event to the current day's log file.
    ///
    /// Returns only after the line has been written and flushed. Failures
    /// surface to the caller; the caller must not fail the user-visible
    /// operation on audit failure, but must report it.
    pub async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let today = event.timestamp.date_naive();

        let mut writer = self.writer.lock().await;
        let needs_reopen = match writer.as_ref() {
            Some(w) => w.date != today,
            None => true,
        };
        if needs_reopen {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_for(today))
                .await?;
            *writer = Some(DayWriter { date: today, file });
        }

        let w = writer.as_mut().expect("writer installed above");
        w.file.write_all(line.as_bytes()).await?;
        w.file.flush().await?;
        w.file.sync_data().await?;
        Ok(())
    }

    /// Delete log files older than the retention window.
    ///
    /// Idempotent; a failure to delete one file is logged and does not abort
    /// the sweep. Returns the number of files deleted.
    pub async fn sweep(&self) -> Result<usize, AuditError> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(self.retention_days as i64);
        let mut deleted = 0;

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(date) = parse_log_file_date(&name.to_string_lossy()) else {
                continue;
            };
            if date < cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        tracing::warn!(
                            file = %entry.path().display(),
                            error = %e,
                            "failed to delete expired audit log file"
                        );
                    }
                }
            }
        }

        Ok(deleted)
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.log", date.format("%Y-%m-%d")))
    }
}

/// Parse the date out of an `audit-YYYY-MM-DD.log` file name.
fn parse_log_file_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix("audit-")?.strip_suffix(".log")?;
    NaiveDate::parse_from_str(rest, "%Y-%m-%d").ok()
}
