//! Shared append-only task log
//!
//! Lines look like `[2024-05-01 12:00:00.123 | 4242] Counter: 17`. Every write
//! happens while the segment lock is held, which serialises writers across
//! processes. [`SharedLog::append`] takes the caller's guard as proof instead
//! of locking on its own, so it is safe to call from inside a critical section.

use crate::core::{Segment, SegmentGuard};
use crate::error::{errors, TaskmemResult};
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Formats a log line for `pid` at `at`.
pub fn format_line(at: DateTime<Local>, pid: u32, message: &str) -> String {
    format!("[{} | {}] {}", at.format(TIMESTAMP_FORMAT), pid, message)
}

#[derive(Debug, Clone)]
pub struct SharedLog {
    path: PathBuf,
    pid: u32,
}

impl SharedLog {
    pub fn new(path: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `message` while the caller holds the segment lock.
    pub fn append(&self, _held: &SegmentGuard<'_>, message: &str) -> TaskmemResult<()> {
        let line = format_line(Local::now(), self.pid, message);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.io_error("open", err))?;
        writeln!(file, "{line}").map_err(|err| self.io_error("write", err))
    }

    /// Takes the segment lock and appends `message`.
    pub fn log(&self, segment: &Segment, message: &str) -> TaskmemResult<()> {
        let guard = segment.lock()?;
        self.append(&guard, message)
    }

    /// Truncates the log when no MAIN process is currently running.
    ///
    /// Returns whether the file was truncated.
    pub fn truncate_if_idle(&self, segment: &Segment) -> TaskmemResult<bool> {
        let guard = segment.lock()?;
        if guard.total_processes > 0 {
            return Ok(false);
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|err| self.io_error("truncate", err))?;
        drop(guard);
        tracing::debug!(path = %self.path.display(), "truncated task log");
        Ok(true)
    }

    fn io_error(&self, action: &str, err: std::io::Error) -> crate::error::TaskmemError {
        errors::filesystem_error(
            format!("failed to {action} task log"),
            self.path.display().to_string(),
            err,
        )
    }
}

/// Downgrades a recoverable task log failure to a warning.
///
/// Log writes never touch shared state, so a missing directory or a full disk
/// must not stop a worker or a copy. Lock failures still propagate.
pub fn tolerate(result: TaskmemResult<()>, action: &str) -> TaskmemResult<()> {
    match result {
        Err(err) if err.is_recoverable() => {
            tracing::warn!("failed to {action}: {err}");
            Ok(())
        }
        other => other,
    }
}
