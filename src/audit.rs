//! # Audit Trail
//!
//! Append-only audit sink for call diagnostics. Every pipeline stage logs
//! what went in and what came out under the owning turn's id, and the raw
//! audio artifacts (transcription input, synthesis output, final companded
//! stream) are written alongside so a bad call can be replayed offline.
//!
//! ## Design:
//! - The sink is injected as a handle (`Arc<dyn AuditSink>`) rather than
//!   reached through a global, so tests swap in an in-memory sink.
//! - Append is the only operation. Entries from concurrent call sessions may
//!   interleave in any order, but a Mutex around the log file guarantees
//!   individual lines are never torn.
//! - Audit failures are reported to the caller as strings; callers log a
//!   warning and keep going. A full disk must not end a phone call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// What a single audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A buffered turn was handed to the conversation pipeline
    TurnStarted,
    /// Transcription produced text (or the turn's final best-effort transcript)
    Transcript,
    /// The reasoning stage requested a tool invocation
    ToolCall,
    /// A tool invocation returned a payload (success or error)
    ToolResult,
    /// Final response text chosen for synthesis
    ResponseText,
    /// Outbound media payload emitted to the transport
    OutboundMedia,
    /// Residual audio transcribed during session close, log-only
    FinalTranscript,
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub stream_sid: String,
    pub turn_id: String,
    pub kind: AuditKind,
    pub detail: Value,
}

impl AuditEntry {
    pub fn new(stream_sid: &str, turn_id: &str, kind: AuditKind, detail: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            stream_sid: stream_sid.to_string(),
            turn_id: turn_id.to_string(),
            kind,
            detail,
        }
    }
}

/// Destination for audit entries and per-turn audio artifacts.
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Append one entry. Ordering is only guaranteed within a session.
    fn append(&self, entry: AuditEntry) -> Result<(), String>;

    /// Persist an audio artifact for a turn (e.g. the WAV sent to
    /// transcription or the companded bytes streamed back out).
    fn append_audio(
        &self,
        stream_sid: &str,
        turn_id: &str,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<(), String>;
}

/// File-backed sink: line-delimited JSON log plus one file per audio artifact.
#[derive(Debug)]
pub struct FileAuditSink {
    dir: PathBuf,
    log: Mutex<File>,
}

impl FileAuditSink {
    /// Create the audit directory (if needed) and open the log for appending.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, String> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| format!("failed to create audit directory {}: {}", dir.display(), e))?;

        let log_path = dir.join("call_audit.jsonl");
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| format!("failed to open audit log {}: {}", log_path.display(), e))?;

        Ok(Self {
            dir,
            log: Mutex::new(log),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: AuditEntry) -> Result<(), String> {
        let line = serde_json::to_string(&entry)
            .map_err(|e| format!("failed to serialize audit entry: {}", e))?;

        // One lock per line keeps concurrent sessions from tearing entries
        let mut log = self
            .log
            .lock()
            .map_err(|_| "audit log lock poisoned".to_string())?;
        writeln!(log, "{}", line).map_err(|e| format!("failed to append audit entry: {}", e))
    }

    fn append_audio(
        &self,
        stream_sid: &str,
        turn_id: &str,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<(), String> {
        let filename = format!("{}_{}_{}.{}", stream_sid, turn_id, label, extension);
        let path = self.dir.join(filename);
        fs::write(&path, bytes)
            .map_err(|e| format!("failed to write audio artifact {}: {}", path.display(), e))
    }
}

/// In-memory sink used by tests to assert on what the pipeline recorded.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    audio_labels: Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn audio_labels(&self) -> Vec<String> {
        self.audio_labels.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: AuditEntry) -> Result<(), String> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    fn append_audio(
        &self,
        _stream_sid: &str,
        _turn_id: &str,
        label: &str,
        extension: &str,
        _bytes: &[u8],
    ) -> Result<(), String> {
        self.audio_labels
            .lock()
            .unwrap()
            .push(format!("{}.{}", label, extension));
        Ok(())
    }
}
