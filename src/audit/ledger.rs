//! Append-only audit ledger: one JSONL file per run.
//!
//! Each run has its own append cursor (next sequence number and last
//! timestamp) behind a mutex keyed by run id, so concurrent runs never
//! contend on each other and a run's entries never interleave.

use crate::core::error::PersistenceError;
use crate::core::types::{AuditEntry, RunState, StageRecord};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Durable, append-only record of stage transitions.
pub trait AuditLedger: Send + Sync {
    /// Stamp `record` with the run's next sequence number and a timestamp,
    /// persist it, and return the stored entry.
    fn append(&self, run_id: Uuid, actor: &str, record: StageRecord) -> Result<AuditEntry, PersistenceError>;

    /// Entries of one run in transition order.
    fn history(&self, run_id: Uuid) -> Result<Vec<AuditEntry>, PersistenceError>;

    /// Entries of all runs at or after `since`, ordered by timestamp.
    fn since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>, PersistenceError>;
}

#[derive(Debug, Default)]
struct Cursor {
    next_sequence: u64,
    last: Option<DateTime<Utc>>,
}

impl Cursor {
    fn stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }

    fn advance(&mut self, entry: &AuditEntry) {
        self.next_sequence = entry.sequence + 1;
        self.last = Some(entry.timestamp);
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stamp_entry(cursor: &Cursor, run_id: Uuid, actor: &str, record: StageRecord) -> AuditEntry {
    AuditEntry {
        run_id,
        sequence: cursor.next_sequence,
        timestamp: cursor.stamp(),
        actor: actor.to_string(),
        stage: record.stage,
        next: record.next,
        input_hash: record.input_hash,
        output_hash: record.output_hash,
        outcome: record.outcome,
    }
}

fn sort_by_time(entries: &mut [AuditEntry]) {
    entries.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.run_id.cmp(&b.run_id))
            .then(a.sequence.cmp(&b.sequence))
    });
}

/// Whether `entries` form a complete causal chain: sequences 0..n without
/// gaps, strictly increasing timestamps, first stage `Resolving`, and each
/// entry's `next` equal to the following entry's `stage`.
pub fn chain_is_contiguous(entries: &[AuditEntry]) -> bool {
    let Some(first) = entries.first() else {
        return false;
    };
    if first.stage != RunState::Resolving {
        return false;
    }
    if entries.iter().enumerate().any(|(i, e)| e.sequence != i as u64) {
        return false;
    }
    entries.windows(2).all(|w| {
        w[0].run_id == w[1].run_id && w[0].next == Some(w[1].stage) && w[0].timestamp < w[1].timestamp
    })
}

// ============================================================================
// JSONL ledger
// ============================================================================

/// File-backed ledger under `<state_dir>/runs/<run_id>.jsonl`.
pub struct JsonlLedger {
    dir: PathBuf,
    cursors: Mutex<HashMap<Uuid, Arc<Mutex<Cursor>>>>,
}

impl JsonlLedger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("runs"),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    /// The cursor for `run_id`, restored from disk the first time a run is
    /// seen by this process.
    fn cursor(&self, run_id: Uuid) -> Result<Arc<Mutex<Cursor>>, PersistenceError> {
        let mut cursors = guard(&self.cursors);
        if let Some(c) = cursors.get(&run_id) {
            return Ok(c.clone());
        }
        let mut cursor = Cursor::default();
        if let Some(last) = self.history(run_id)?.last() {
            cursor.advance(last);
        }
        let cursor = Arc::new(Mutex::new(cursor));
        cursors.insert(run_id, cursor.clone());
        Ok(cursor)
    }

    fn read_file(path: &Path) -> Result<Vec<AuditEntry>, PersistenceError> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PersistenceError::new(format!(
                    "cannot open {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut entries = Vec::new();
        for (i, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| PersistenceError::new(format!("read error in {}: {}", path.display(), e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
                PersistenceError::new(format!("{}:{}: invalid entry: {}", path.display(), i + 1, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl AuditLedger for JsonlLedger {
    /// Blocking: writes and fsyncs one line. Async callers run this on the
    /// blocking pool.
    ///
    /// A failed write discards the cached cursor so the next append re-reads
    /// the file. Once the line is written the cursor advances even if the
    /// fsync fails, so a sequence number on disk is never handed out again.
    fn append(&self, run_id: Uuid, actor: &str, record: StageRecord) -> Result<AuditEntry, PersistenceError> {
        let cursor = self.cursor(run_id)?;
        let mut cursor = guard(&cursor);
        let entry = stamp_entry(&cursor, run_id, actor, record);
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| PersistenceError::new(format!("JSON serialize error: {}", e)))?;
        line.push('\n');

        let path = self.run_path(run_id);
        let written = std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("cannot create {}: {}", self.dir.display(), e))
            .and_then(|()| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| format!("cannot open audit log {}: {}", path.display(), e))
            })
            .and_then(|mut file| {
                file.write_all(line.as_bytes())
                    .map(|()| file)
                    .map_err(|e| format!("write error in {}: {}", path.display(), e))
            });
        let file = match written {
            Ok(file) => file,
            Err(message) => {
                guard(&self.cursors).remove(&run_id);
                return Err(PersistenceError::new(message));
            }
        };
        cursor.advance(&entry);
        file.sync_data()
            .map_err(|e| PersistenceError::new(format!("sync error in {}: {}", path.display(), e)))?;

        tracing::debug!(%run_id, sequence = entry.sequence, stage = %entry.stage, "audit entry appended");
        Ok(entry)
    }

    fn history(&self, run_id: Uuid) -> Result<Vec<AuditEntry>, PersistenceError> {
        let mut entries = Self::read_file(&self.run_path(run_id))?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    fn since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>, PersistenceError> {
        let dir = match std::fs::read_dir(&self.dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PersistenceError::new(format!(
                    "cannot list {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };
        let mut out = Vec::new();
        for item in dir {
            let path = item
                .map_err(|e| PersistenceError::new(format!("cannot list runs: {}", e)))?
                .path();
            if path.extension().and_then(|x| x.to_str()) != Some("jsonl") {
                continue;
            }
            out.extend(
                Self::read_file(&path)?
                    .into_iter()
                    .filter(|e| e.timestamp >= since),
            );
        }
        sort_by_time(&mut out);
        Ok(out)
    }
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// Ledger kept in memory. `failing_after(n)` makes every append past the
/// first `n` fail, for exercising persistence failures.
#[derive(Default)]
pub struct MemoryLedger {
    runs: Mutex<HashMap<Uuid, Vec<AuditEntry>>>,
    fail_after: Option<usize>,
    appended: Mutex<usize>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(appends: usize) -> Self {
        Self {
            fail_after: Some(appends),
            ..Self::default()
        }
    }
}

impl AuditLedger for MemoryLedger {
    fn append(&self, run_id: Uuid, actor: &str, record: StageRecord) -> Result<AuditEntry, PersistenceError> {
        {
            let mut appended = guard(&self.appended);
            if self.fail_after.is_some_and(|n| *appended >= n) {
                return Err(PersistenceError::new("audit store unavailable"));
            }
            *appended += 1;
        }
        let mut runs = guard(&self.runs);
        let entries = runs.entry(run_id).or_default();
        let mut cursor = Cursor::default();
        if let Some(last) = entries.last() {
            cursor.advance(last);
        }
        let entry = stamp_entry(&cursor, run_id, actor, record);
        entries.push(entry.clone());
        Ok(entry)
    }

    fn history(&self, run_id: Uuid) -> Result<Vec<AuditEntry>, PersistenceError> {
        Ok(guard(&self.runs).get(&run_id).cloned().unwrap_or_default())
    }

    fn since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>, PersistenceError> {
        let mut out: Vec<AuditEntry> = guard(&self.runs)
            .values()
            .flatten()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        sort_by_time(&mut out);
        Ok(out)
    }
}
