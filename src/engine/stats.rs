// src/engine/stats.rs

//! Per-run counters and the summary emitted when a run completes.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::files::{FileKey, FsCountersSnapshot};

/// Live counters shared by every job of the current run.
#[derive(Debug, Default)]
pub struct StatsCounters {
    jobs: AtomicUsize,
    warnings: AtomicUsize,
    errors: AtomicUsize,
    files_updated: AtomicUsize,
    files_deleted: AtomicUsize,
}

impl StatsCounters {
    pub(crate) fn job_finished(&self, warnings: usize, errors: usize) {
        self.jobs.fetch_add(1, Ordering::Relaxed);
        self.warnings.fetch_add(warnings, Ordering::Relaxed);
        self.errors.fetch_add(errors, Ordering::Relaxed);
    }

    pub(crate) fn file_updated(&self) {
        self.files_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file_deleted(&self) {
        self.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunStats {
        RunStats {
            jobs: self.jobs.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            files_updated: self.files_updated.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
        }
    }

    /// Return the current values and start from zero.
    pub(crate) fn take(&self) -> RunStats {
        RunStats {
            jobs: self.jobs.swap(0, Ordering::Relaxed),
            warnings: self.warnings.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
            files_updated: self.files_updated.swap(0, Ordering::Relaxed),
            files_deleted: self.files_deleted.swap(0, Ordering::Relaxed),
        }
    }
}

/// What [`crate::Engine::clean`] found in the target directories after
/// pruning the cleaned tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Files in a target directory that no task recorded as its output.
    pub stray: Vec<FileKey>,
    /// Whether `stray` files were deleted.
    pub stray_removed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Jobs whose task function ran.
    pub jobs: usize,
    pub warnings: usize,
    pub errors: usize,
    pub files_updated: usize,
    pub files_deleted: usize,
}

/// Outcome of a run, emitted each time every active task is terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub success: bool,
    /// Tasks that ended in `error`.
    pub errored_tasks: Vec<String>,
    /// Tasks that were aborted because a dependency failed.
    pub aborted_tasks: Vec<String>,
    pub stats: RunStats,
    /// Physical filesystem operations during the run.
    pub fs: FsCountersSnapshot,
}

impl RunSummary {
    /// Process exit code for a driver: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}
