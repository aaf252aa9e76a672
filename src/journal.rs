//! Append-only run files: the checkpoint of attempted IDs, the processed
//! list and the error log.

use std::collections::HashSet;
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::{error, warn};

use crate::entity::EntityId;

/// A line-oriented file opened for append, shared between workers.
pub struct AppendLog {
    path: PathBuf,
    file: Mutex<File>,
    durable: bool,
}

impl AppendLog {
    /// `durable` logs are synced to disk after every line.
    pub fn open(path: &Path, durable: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            durable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(buf.as_bytes())?;
        if self.durable {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Non-empty lines of `path`; a missing file reads as empty.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// IDs already attempted, in this run or any earlier one.
///
/// An ID is appended (and synced) before it is fetched, so a crash never
/// causes a second attempt.
pub struct Checkpoint {
    log: AppendLog,
    attempted: Mutex<HashSet<EntityId>>,
}

impl Checkpoint {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut attempted = HashSet::new();
        for line in read_lines(path)? {
            match line.parse::<EntityId>() {
                Ok(id) => {
                    attempted.insert(id);
                }
                Err(_) => warn!(path = %path.display(), line = %line, "Ignoring malformed checkpoint line"),
            }
        }
        Ok(Self {
            log: AppendLog::open(path, true)?,
            attempted: Mutex::new(attempted),
        })
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn mark_attempted(&self, id: EntityId) -> io::Result<()> {
        self.log.append_line(&id.to_string())?;
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.attempted.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Truncate the checkpoint file at `path`.
    pub fn clear(path: &Path) -> io::Result<()> {
        match fs::metadata(path) {
            Ok(_) => File::create(path).map(drop),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Where per-ID errors go. Recording never fails the caller.
pub trait ErrorSink: Send + Sync {
    fn record(&self, id: EntityId, origin: &str, error: &dyn Display);
}

/// Error log with lines `<id> -- <timestamp> -- <error> -- <origin>`.
pub struct ErrorLog {
    log: AppendLog,
}

impl ErrorLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            log: AppendLog::open(path, false)?,
        })
    }
}

impl ErrorSink for ErrorLog {
    fn record(&self, id: EntityId, origin: &str, err: &dyn Display) {
        let message = one_line(&err.to_string());
        warn!(cvlac_id = %id, origin, error = %message, "CV error");
        let line = format!("{} -- {} -- {} -- {} ", id, Utc::now().to_rfc3339(), message, origin);
        if let Err(e) = self.log.append_line(&line) {
            error!(path = %self.log.path().display(), error = %e, "Failed to append to error log");
        }
    }
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
