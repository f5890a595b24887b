// src/files/mod.rs

//! File addressing and the caching file store.
//!
//! Every file the engine touches is addressed as `bucket:relative`, where the
//! bucket is `source`, a configured target, or a task's private output area.
//! [`store::FileStore`] is the only component that performs disk I/O on
//! those files.

use std::fmt;
use std::str::Utf8Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::SOURCE_BUCKET;
use crate::types::{FsEventKind, Timestamp};

pub mod glob;
pub mod store;

pub use glob::PatternSet;
pub use store::{FileStore, PutOutcome};

/// Identity of a file: `bucket:relative`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    bucket: String,
    relative: String,
}

impl FileKey {
    pub fn new(bucket: impl Into<String>, relative: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            relative: relative.into(),
        }
    }

    pub fn source(relative: impl Into<String>) -> Self {
        Self::new(SOURCE_BUCKET, relative)
    }

    /// Parse `bucket:relative`; a name without a bucket refers to `source`.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((bucket, relative)) => Self::new(bucket, relative),
            None => Self::source(name),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.relative)
    }
}

impl From<&str> for FileKey {
    fn from(name: &str) -> Self {
        FileKey::parse(name)
    }
}

/// Immutable snapshot of a loaded file, as handed to task functions.
#[derive(Debug, Clone)]
pub struct BuildFile {
    key: FileKey,
    timestamp: Timestamp,
    contents: Arc<[u8]>,
}

impl BuildFile {
    pub fn new(key: FileKey, timestamp: Timestamp, contents: Arc<[u8]>) -> Self {
        Self {
            key,
            timestamp,
            contents,
        }
    }

    pub fn key(&self) -> &FileKey {
        &self.key
    }

    pub fn bucket(&self) -> &str {
        self.key.bucket()
    }

    pub fn relative(&self) -> &str {
        self.key.relative()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn contents_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.contents)
    }

    pub fn shared_contents(&self) -> Arc<[u8]> {
        Arc::clone(&self.contents)
    }
}

/// A filesystem change, either observed by the watcher or injected by a
/// caller. `stat` carries the new mtime when the observer already knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub key: FileKey,
    pub stat: Option<Timestamp>,
}

impl FsEvent {
    pub fn new(kind: FsEventKind, key: FileKey, stat: Option<Timestamp>) -> Self {
        Self { kind, key, stat }
    }

    pub fn add(key: FileKey) -> Self {
        Self::new(FsEventKind::Add, key, None)
    }

    pub fn change(key: FileKey) -> Self {
        Self::new(FsEventKind::Change, key, None)
    }

    pub fn unlink(key: FileKey) -> Self {
        Self::new(FsEventKind::Unlink, key, None)
    }

    pub fn with_stat(mut self, ts: Timestamp) -> Self {
        self.stat = Some(ts);
        self
    }
}

/// Physical operation counters.
#[derive(Debug, Default)]
pub struct FsCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    stats: AtomicU64,
    deletes: AtomicU64,
}

/// Point-in-time copy of [`FsCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FsCountersSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub stats: u64,
    pub deletes: u64,
}

impl FsCounters {
    pub(crate) fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stat(&self) {
        self.stats.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FsCountersSnapshot {
        FsCountersSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            stats: self.stats.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

impl FsCountersSnapshot {
    /// Operations performed since `earlier`.
    pub fn since(&self, earlier: &FsCountersSnapshot) -> FsCountersSnapshot {
        FsCountersSnapshot {
            reads: self.reads.saturating_sub(earlier.reads),
            writes: self.writes.saturating_sub(earlier.writes),
            stats: self.stats.saturating_sub(earlier.stats),
            deletes: self.deletes.saturating_sub(earlier.deletes),
        }
    }
}

/// Hex blake3 digest of file contents, as stored in output records.
pub fn content_hash(contents: &[u8]) -> String {
    blake3::hash(contents).to_hex().to_string()
}
