//! Per-run execution log
//!
//! Append-only, ordered record of everything a run did. The log is the
//! sole source of truth for observability queries: the full run history,
//! including every discarded attempt, can be reconstructed from it alone.

use crate::models::{LogEntry, LogEntryKind, TaskInput};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::{Arc, RwLock};

/// Shared handle to one run's append-only event log.
///
/// Cloning is cheap; all clones observe the same ordered sequence.
/// Entries are only ever appended, never removed or reordered, and each
/// carries a strictly increasing sequence number (wall-clock timestamps
/// can tie within a millisecond, the sequence is authoritative).
#[derive(Clone)]
pub struct ExecutionLog {
    inner: Arc<RwLock<LogInner>>,
}

struct LogInner {
    entries: Vec<LogEntry>,
    next_sequence: u64,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LogInner {
                entries: Vec::new(),
                next_sequence: 0,
            })),
        }
    }

    /// Append one entry, stamping sequence and timestamp.
    pub fn append(&self, kind: LogEntryKind) -> LogEntry {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = LogEntry {
            sequence: inner.next_sequence,
            timestamp: Utc::now(),
            kind,
        };
        inner.next_sequence += 1;
        inner.entries.push(entry.clone());
        entry
    }

    /// Ordered copy of all entries appended so far.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute SHA256 hash of a task input for archive integrity checks.
/// Streams JSON directly into the hasher, no intermediate String.
pub fn compute_task_hash(task: &TaskInput) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), task).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//
// ================= Tests =================
//
