//! Per-run report: counters, per-table op stats, attempt history and errors,
//! flushed to `<data_dir>/sessions/<session_id>.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persist::OpKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub inserts: u64,
    pub updates: u64,
    pub skips: u64,
    pub errors: u64,
}

impl TableStats {
    pub fn add(&mut self, kind: OpKind) {
        match kind {
            OpKind::Insert => self.inserts += 1,
            OpKind::Update => self.updates += 1,
            OpKind::Skip => self.skips += 1,
            OpKind::Error => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Stored,
    /// Fetched, but nothing to store. Still a success.
    Empty,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub cvlac_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub tables: BTreeMap<String, TableStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn new(cvlac_id: String, outcome: AttemptOutcome) -> Self {
        Self {
            cvlac_id,
            timestamp: Utc::now(),
            success: outcome != AttemptOutcome::Failed,
            outcome,
            tables: BTreeMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub cvlac_id: String,
    pub timestamp: DateTime<Utc>,
    pub origin: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cvlacs_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Percentage of attempts that succeeded; set when the session closes.
    pub success_rate: Option<f64>,
    pub table_stats: BTreeMap<String, TableStats>,
    pub processing_history: Vec<HistoryEntry>,
    pub errors: Vec<ErrorEntry>,
}

impl SessionReport {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            ended_at: None,
            cvlacs_processed: 0,
            success_count: 0,
            error_count: 0,
            success_rate: None,
            table_stats: BTreeMap::new(),
            processing_history: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("session-{}-{}", now, std::process::id())
}

struct Inner {
    report: SessionReport,
    unflushed: usize,
}

pub struct SessionRecorder {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    flush_every: usize,
}

impl SessionRecorder {
    /// Start a session under `sessions_dir` and write its initial report.
    pub fn create(sessions_dir: &Path, flush_every: usize) -> Result<Self> {
        fs::create_dir_all(sessions_dir)
            .with_context(|| format!("Failed to create {:?}", sessions_dir))?;
        let session_id = new_session_id();
        let path = sessions_dir.join(format!("{}.json", session_id));
        let recorder = Self {
            inner: Mutex::new(Inner {
                report: SessionReport::new(session_id),
                unflushed: 0,
            }),
            path: Some(path),
            flush_every: flush_every.max(1),
        };
        recorder.flush()?;
        Ok(recorder)
    }

    /// A recorder that never touches disk.
    pub fn detached() -> Self {
        Self {
            inner: Mutex::new(Inner {
                report: SessionReport::new(new_session_id()),
                unflushed: 0,
            }),
            path: None,
            flush_every: usize::MAX,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self, table: &str, kind: OpKind) {
        self.lock()
            .report
            .table_stats
            .entry(table.to_string())
            .or_default()
            .add(kind);
    }

    pub fn record_error(&self, cvlac_id: &str, origin: &str, error: &str) {
        self.lock().report.errors.push(ErrorEntry {
            cvlac_id: cvlac_id.to_string(),
            timestamp: Utc::now(),
            origin: origin.to_string(),
            error: error.to_string(),
        });
    }

    /// Append one attempt to the history; flushes every `flush_every` attempts.
    pub fn record_attempt(&self, entry: HistoryEntry) {
        let due = {
            let mut inner = self.lock();
            let report = &mut inner.report;
            report.cvlacs_processed += 1;
            if entry.success {
                report.success_count += 1;
            } else {
                report.error_count += 1;
            }
            report.processing_history.push(entry);
            inner.unflushed += 1;
            inner.unflushed >= self.flush_every
        };
        if due {
            if let Err(e) = self.flush() {
                warn!(error = %e, "Failed to flush session report");
            }
        }
    }

    pub fn snapshot(&self) -> SessionReport {
        self.lock().report.clone()
    }

    /// Write the report atomically (temp file + rename). The lock is held
    /// until the rename, so flushes never share the temp file and an older
    /// snapshot never replaces a newer one.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut inner = self.lock();
        inner.unflushed = 0;
        let json = serde_json::to_vec_pretty(&inner.report)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
        drop(inner);
        debug!(path = %path.display(), "Session report flushed");
        Ok(())
    }

    /// Close the session: stamp the end time and success rate, then flush.
    pub fn finish(&self) -> Result<SessionReport> {
        {
            let mut inner = self.lock();
            let report = &mut inner.report;
            report.ended_at = Some(Utc::now());
            report.success_rate = Some(if report.cvlacs_processed == 0 {
                0.0
            } else {
                report.success_count as f64 * 100.0 / report.cvlacs_processed as f64
            });
        }
        self.flush()?;
        Ok(self.snapshot())
    }
}

/// Most recent report in `sessions_dir`, if any.
pub fn latest(sessions_dir: &Path) -> Result<Option<SessionReport>> {
    let entries = match fs::read_dir(sessions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", sessions_dir)),
    };
    let newest = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .max_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok());
    let Some(path) = newest else {
        return Ok(None);
    };
    let bytes = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
    let report = serde_json::from_slice(&bytes).with_context(|| format!("Malformed session report {:?}", path))?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_history() {
        let session = SessionRecorder::detached();
        session.count("articulos", OpKind::Insert);
        session.count("articulos", OpKind::Update);
        session.count("articulos", OpKind::Update);
        session.record_attempt(HistoryEntry::new("0000000001".into(), AttemptOutcome::Stored));
        session.record_attempt(HistoryEntry::new("0000000002".into(), AttemptOutcome::Empty));
        session.record_attempt(HistoryEntry::new("0000000003".into(), AttemptOutcome::Failed));

        let report = session.finish().unwrap();
        assert_eq!(report.cvlacs_processed, 3);
        assert_eq!((report.success_count, report.error_count), (2, 1));
        assert_eq!(report.table_stats["articulos"].updates, 2);
        assert_eq!(report.table_stats["articulos"].inserts, 1);
        assert!(report.ended_at.is_some());
        let rate = report.success_rate.unwrap();
        assert!((rate - 66.666).abs() < 0.01);
    }

    #[test]
    fn empty_session_rate_is_zero() {
        let report = SessionRecorder::detached().finish().unwrap();
        assert_eq!(report.success_rate, Some(0.0));
    }

    #[test]
    fn flushes_periodically_and_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join("sessions");
        let session = SessionRecorder::create(&sessions, 2).unwrap();
        let path = session.path().unwrap().to_path_buf();

        let on_disk = || -> SessionReport { serde_json::from_slice(&fs::read(&path).unwrap()).unwrap() };
        assert_eq!(on_disk().cvlacs_processed, 0);

        session.record_attempt(HistoryEntry::new("0000000001".into(), AttemptOutcome::Stored));
        assert_eq!(on_disk().cvlacs_processed, 0);
        session.record_attempt(HistoryEntry::new("0000000002".into(), AttemptOutcome::Stored));
        assert_eq!(on_disk().cvlacs_processed, 2);

        session.record_attempt(HistoryEntry::new("0000000003".into(), AttemptOutcome::Failed));
        session.record_error("0000000003", "fetch", "timed out");
        session.finish().unwrap();

        let report = on_disk();
        assert_eq!(report.cvlacs_processed, 3);
        assert_eq!(report.errors.len(), 1);
        assert!(report.ended_at.is_some());
        assert!(!path.with_extension("json.tmp").exists());

        assert_eq!(latest(&sessions).unwrap().unwrap().session_id, report.session_id);
    }

    #[test]
    fn concurrent_flushes_leave_a_valid_report() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionRecorder::create(&dir.path().join("sessions"), 1).unwrap();
        let path = session.path().unwrap().to_path_buf();

        std::thread::scope(|s| {
            for t in 0..8 {
                let session = &session;
                s.spawn(move || {
                    for i in 0..25 {
                        let id = format!("{:010}", t * 100 + i);
                        session.record_attempt(HistoryEntry::new(id, AttemptOutcome::Stored));
                    }
                });
            }
        });

        let report: SessionReport = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(report.cvlacs_processed, 200);
        assert_eq!(report.processing_history.len(), 200);
        assert!(!path.with_extension("json.tmp").exists());

        session.finish().unwrap();
        let report: SessionReport = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(report.success_count, 200);
        assert!(report.ended_at.is_some());
    }

    #[test]
    fn history_entry_shape() {
        let mut entry = HistoryEntry::new("0000000009".into(), AttemptOutcome::Empty);
        entry.tables.insert("idiomas".into(), TableStats { inserts: 1, ..Default::default() });
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "empty");
        assert_eq!(json["success"], true);
        assert_eq!(json["tables"]["idiomas"]["inserts"], 1);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn latest_without_sessions() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest(&dir.path().join("nope")).unwrap().is_none());
    }
}
