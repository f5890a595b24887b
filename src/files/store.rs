// src/files/store.rs

//! The caching file store.
//!
//! Each `bucket:relative` key gets a slot guarded by an async mutex. Holding
//! the slot lock for the whole physical operation gives "loader" semantics:
//! a second requester waits on the lock and then finds the result already
//! cached, so there is never more than one read or stat in flight per path.
//!
//! Alongside the slots the store keeps the last observed timestamp of every
//! key. That index answers `glob` for non-source buckets and the cheap
//! "would this event change anything" check without touching slot locks.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use futures::stream;
use tracing::{debug, trace, warn};

use crate::config::{BuildConfig, IoSection, SOURCE_BUCKET};
use crate::errors::FileError;
use crate::fs::{FileSystem, remove_file_with_rmdir, write_with_mkdir};
use crate::state::OutputRecord;
use crate::types::{FsEventKind, Timestamp};

use super::glob::PatternSet;
use super::{BuildFile, FileKey, FsCounters, FsCountersSnapshot, FsEvent, content_hash};

/// Parallel stats issued while scanning a bucket.
const SCAN_STAT_LIMIT: usize = 4;

#[derive(Debug, Default)]
struct SlotState {
    /// `None` until observed; `Some(DELETED)` once known missing.
    timestamp: Option<Timestamp>,
    contents: Option<Arc<[u8]>>,
    /// Sticky read failure, cleared by a filesystem event or a write.
    err: Option<FileError>,
    /// `task:job` that last wrote the file.
    who: Option<String>,
}

#[derive(Debug, Default)]
struct FileSlot {
    state: tokio::sync::Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct Index {
    slots: HashMap<FileKey, Arc<FileSlot>>,
    known: BTreeMap<FileKey, Timestamp>,
    /// Task that last wrote or adopted each output. Survives pruning so the
    /// unlink of an output still reaches the producer's readers.
    owners: HashMap<FileKey, String>,
}

/// Task part of a `task:job` writer id.
fn owner_task(who: &str) -> &str {
    who.split_once(':').map_or(who, |(task, _)| task)
}

/// Result of [`FileStore::put_output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub ts: Timestamp,
    pub hash: String,
    /// False when the bytes matched the previous record and the write was skipped.
    pub written: bool,
}

impl PutOutcome {
    pub fn record(&self) -> OutputRecord {
        OutputRecord {
            ts: self.ts,
            hash: self.hash.clone(),
        }
    }
}

#[derive(Debug)]
pub struct FileStore {
    fs: Arc<dyn FileSystem>,
    buckets: BTreeMap<String, PathBuf>,
    /// Buckets fed by the external watcher (source and targets).
    watched: Vec<String>,
    /// Directories never walked while scanning the source tree.
    skip_dirs: Vec<PathBuf>,
    io: IoSection,
    index: Mutex<Index>,
    counters: FsCounters,
}

impl FileStore {
    /// Create a store with `source` and every configured target registered as
    /// buckets. Task output buckets are added with [`FileStore::add_bucket`].
    pub fn new(fs: Arc<dyn FileSystem>, config: &BuildConfig) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(SOURCE_BUCKET.to_string(), config.source.clone());
        let mut watched = vec![SOURCE_BUCKET.to_string()];
        let mut skip_dirs = vec![config.statedir.clone()];
        for (name, dir) in &config.targets {
            buckets.insert(name.clone(), dir.clone());
            watched.push(name.clone());
            skip_dirs.push(dir.clone());
        }
        Self {
            fs,
            buckets,
            watched,
            skip_dirs,
            io: config.io,
            index: Mutex::new(Index::default()),
            counters: FsCounters::default(),
        }
    }

    pub fn add_bucket(&mut self, name: impl Into<String>, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.skip_dirs.push(dir.clone());
        self.buckets.insert(name.into(), dir);
    }

    pub fn filesystem(&self) -> Arc<dyn FileSystem> {
        Arc::clone(&self.fs)
    }

    pub fn counters(&self) -> FsCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn bucket_dir(&self, bucket: &str) -> Result<&Path, FileError> {
        self.buckets
            .get(bucket)
            .map(PathBuf::as_path)
            .ok_or_else(|| FileError::UnknownBucket(bucket.to_string()))
    }

    pub fn disk_path(&self, key: &FileKey) -> Result<PathBuf, FileError> {
        Ok(self.bucket_dir(key.bucket())?.join(key.relative()))
    }

    /// Directories an external watcher should observe.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.watched
            .iter()
            .filter_map(|b| self.buckets.get(b).cloned())
            .collect()
    }

    /// Map an on-disk path from the watcher back to a key.
    ///
    /// Picks the most specific watched bucket containing the path and ignores
    /// anything under a skipped directory (state, task outputs) when that
    /// bucket is `source`.
    pub fn locate(&self, path: &Path) -> Option<FileKey> {
        let (bucket, dir) = self
            .watched
            .iter()
            .filter_map(|b| self.buckets.get(b).map(|d| (b, d)))
            .filter(|(_, d)| path.starts_with(d))
            .max_by_key(|(_, d)| d.components().count())?;

        if bucket == SOURCE_BUCKET && self.skip_dirs.iter().any(|s| path.starts_with(s)) {
            return None;
        }

        let relative = crate::watch::path_utils::relative_str(dir, path)?;
        if relative.is_empty() {
            return None;
        }
        Some(FileKey::new(bucket.clone(), relative))
    }

    fn lock_index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &FileKey) -> Arc<FileSlot> {
        let mut index = self.lock_index();
        Arc::clone(index.slots.entry(key.clone()).or_default())
    }

    fn set_known(&self, key: &FileKey, ts: Timestamp) {
        self.lock_index().known.insert(key.clone(), ts);
    }

    fn set_owner(&self, key: &FileKey, who: &str) {
        self.lock_index()
            .owners
            .insert(key.clone(), owner_task(who).to_string());
    }

    /// Task whose output `key` is, as far as this session has seen.
    pub fn owner_of(&self, key: &FileKey) -> Option<String> {
        self.lock_index().owners.get(key).cloned()
    }

    /// Last observed timestamp of `key`, if it was ever observed.
    pub fn known_timestamp(&self, key: &FileKey) -> Option<Timestamp> {
        self.lock_index().known.get(key).copied()
    }

    /// Known, existing files below the directory `dir`.
    pub fn known_under(&self, dir: &FileKey) -> Vec<FileKey> {
        let prefix = match dir.relative() {
            "" => String::new(),
            rel => format!("{}/", rel.trim_end_matches('/')),
        };
        let start = FileKey::new(dir.bucket(), prefix.clone());
        self.lock_index()
            .known
            .range(start..)
            .take_while(|(key, _)| key.bucket() == dir.bucket() && key.relative().starts_with(&prefix))
            .filter(|(_, ts)| !ts.is_deleted())
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FileSystem) -> io::Result<T> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        match tokio::task::spawn_blocking(move || f(fs.as_ref())).await {
            Ok(result) => result,
            Err(join) => Err(io::Error::other(join.to_string())),
        }
    }

    async fn stat_locked(&self, key: &FileKey, slot: &mut SlotState) -> Result<Timestamp, FileError> {
        if let Some(ts) = slot.timestamp {
            return Ok(ts);
        }
        let path = self.disk_path(key)?;
        self.counters.stat();
        let ts = match self.blocking(move |fs| fs.modified(&path)).await {
            Ok(ts) => ts,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Timestamp::DELETED,
            Err(err) => return Err(FileError::io(key, err)),
        };
        slot.timestamp = Some(ts);
        self.set_known(key, ts);
        Ok(ts)
    }

    /// Metadata only. A missing file yields [`Timestamp::DELETED`].
    pub async fn stat(&self, key: &FileKey) -> Result<Timestamp, FileError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        self.stat_locked(key, &mut state).await
    }

    /// Load and cache a file's bytes.
    ///
    /// "Busy" failures wait a short fixed delay, other failures back off
    /// linearly, both bounded by the configured retry budget. A file that does
    /// not exist is not retried.
    pub async fn get(&self, key: &FileKey) -> Result<BuildFile, FileError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;

        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        if state.timestamp == Some(Timestamp::DELETED) {
            return Err(FileError::Missing(key.to_string()));
        }
        if let (Some(ts), Some(contents)) = (state.timestamp, &state.contents) {
            return Ok(BuildFile::new(key.clone(), ts, Arc::clone(contents)));
        }

        let path = self.disk_path(key)?;
        let mut attempt: u32 = 0;
        loop {
            self.counters.stat();
            self.counters.read();
            let p = path.clone();
            // Stat before reading: if the file changes in between, the
            // recorded timestamp is older than the bytes and the next event
            // for it will not be mistaken for a no-op.
            let result = self
                .blocking(move |fs| {
                    let ts = fs.modified(&p)?;
                    let bytes = fs.read(&p)?;
                    Ok((ts, bytes))
                })
                .await;

            match result {
                Ok((ts, bytes)) => {
                    trace!(key = %key, ts = %ts, "loaded file");
                    let contents: Arc<[u8]> = Arc::from(bytes);
                    state.timestamp = Some(ts);
                    state.contents = Some(Arc::clone(&contents));
                    self.set_known(key, ts);
                    return Ok(BuildFile::new(key.clone(), ts, contents));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    state.timestamp = Some(Timestamp::DELETED);
                    state.contents = None;
                    self.set_known(key, Timestamp::DELETED);
                    return Err(FileError::Missing(key.to_string()));
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > self.io.read_retries {
                        warn!(key = %key, attempts = attempt, "giving up reading file: {err}");
                        let err = FileError::io(key, err);
                        state.err = Some(err.clone());
                        return Err(err);
                    }
                    let delay = if err.kind() == io::ErrorKind::ResourceBusy {
                        self.io.busy_delay()
                    } else {
                        self.io.backoff_delay(attempt)
                    };
                    debug!(key = %key, attempt, ?delay, "read failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn check_owner(key: &FileKey, state: &SlotState, who: &str) -> Result<(), FileError> {
        match &state.who {
            Some(owner) if owner != who => Err(FileError::Conflict {
                key: key.to_string(),
                owner: owner.clone(),
                who: who.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn write_locked(
        &self,
        key: &FileKey,
        state: &mut SlotState,
        contents: Arc<[u8]>,
        who: &str,
    ) -> Result<Timestamp, FileError> {
        let path = self.disk_path(key)?;
        self.counters.write();
        self.counters.stat();
        let data = Arc::clone(&contents);
        let ts = self
            .blocking(move |fs| {
                write_with_mkdir(fs, &path, &data)?;
                fs.modified(&path)
            })
            .await
            .map_err(|e| FileError::io(key, e))?;
        debug!(key = %key, who = %who, "wrote file");
        state.timestamp = Some(ts);
        state.contents = Some(contents);
        state.err = None;
        state.who = Some(who.to_string());
        self.set_known(key, ts);
        self.set_owner(key, who);
        Ok(ts)
    }

    /// Write a file on behalf of `who`, rejecting the write if another job
    /// already owns the path.
    pub async fn put(&self, key: &FileKey, contents: Arc<[u8]>, who: &str) -> Result<BuildFile, FileError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        Self::check_owner(key, &state, who)?;
        let ts = self.write_locked(key, &mut state, Arc::clone(&contents), who).await?;
        Ok(BuildFile::new(key.clone(), ts, contents))
    }

    /// Write a job output, skipping the physical write when the bytes hash to
    /// the previous record and the file on disk still carries its timestamp.
    pub async fn put_output(
        &self,
        key: &FileKey,
        contents: Arc<[u8]>,
        who: &str,
        previous: Option<&OutputRecord>,
    ) -> Result<PutOutcome, FileError> {
        let hash = content_hash(&contents);
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        Self::check_owner(key, &state, who)?;

        if let Some(prev) = previous {
            if prev.hash == hash {
                let ts = self.stat_locked(key, &mut state).await?;
                if ts == prev.ts {
                    trace!(key = %key, "output unchanged, skipping write");
                    state.who = Some(who.to_string());
                    self.set_owner(key, who);
                    state.contents = Some(contents);
                    return Ok(PutOutcome {
                        ts,
                        hash,
                        written: false,
                    });
                }
            }
        }

        let ts = self.write_locked(key, &mut state, contents, who).await?;
        Ok(PutOutcome {
            ts,
            hash,
            written: true,
        })
    }

    /// Take ownership of an existing output without rewriting it.
    pub async fn claim(&self, key: &FileKey, who: &str) -> Result<Timestamp, FileError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        Self::check_owner(key, &state, who)?;
        let ts = self.stat_locked(key, &mut state).await?;
        if ts.is_deleted() {
            return Err(FileError::Missing(key.to_string()));
        }
        state.who = Some(who.to_string());
        self.set_owner(key, who);
        Ok(ts)
    }

    /// Record `who` as the writer of outputs left on disk by an earlier,
    /// still valid run. Keys another job already wrote are left alone.
    pub async fn adopt<'a>(&self, keys: impl IntoIterator<Item = &'a FileKey>, who: &str) {
        for key in keys {
            let slot = self.slot(key);
            let mut state = slot.state.lock().await;
            if state.who.is_none() {
                state.who = Some(who.to_string());
                self.set_owner(key, who);
            }
        }
    }

    /// Delete a file and any directories left empty below its bucket root.
    ///
    /// With `who` set, the file is left alone if another job has since taken
    /// ownership of it. Returns whether anything was pruned.
    pub async fn prune(&self, key: &FileKey, who: Option<&str>) -> Result<bool, FileError> {
        let slot = self.slot(key);
        let mut state = slot.state.lock().await;
        if let (Some(who), Some(owner)) = (who, &state.who) {
            if owner != who {
                debug!(key = %key, owner = %owner, "not pruning, now owned by another job");
                return Ok(false);
            }
        }

        let path = self.disk_path(key)?;
        let root = self.bucket_dir(key.bucket())?.to_path_buf();
        self.counters.delete();
        self.blocking(move |fs| remove_file_with_rmdir(fs, &path, &root))
            .await
            .map_err(|e| FileError::io(key, e))?;
        debug!(key = %key, "pruned file");

        state.timestamp = Some(Timestamp::DELETED);
        state.contents = None;
        state.err = None;
        state.who = None;
        self.set_known(key, Timestamp::DELETED);
        Ok(true)
    }

    /// Match patterns against files currently known to exist in a bucket.
    ///
    /// With `producer` set only that task's outputs match, so tasks sharing
    /// a target never see each other's files.
    pub fn glob(&self, bucket: &str, patterns: &PatternSet, producer: Option<&str>) -> Vec<FileKey> {
        let index = self.lock_index();
        index
            .known
            .iter()
            .filter(|(key, ts)| key.bucket() == bucket && !ts.is_deleted())
            .filter(|(key, _)| patterns.is_match(key.relative()))
            .filter(|(key, _)| match producer {
                Some(p) => index.owners.get(*key).is_some_and(|o| o == p),
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Walk a bucket on disk, match patterns and stat every candidate.
    pub async fn scan(&self, bucket: &str, patterns: &PatternSet) -> Result<Vec<FileKey>, FileError> {
        let root = self.bucket_dir(bucket)?.to_path_buf();
        let skip: Vec<PathBuf> = self
            .skip_dirs
            .iter()
            .filter(|d| **d != root)
            .cloned()
            .collect();
        let walk_root = root.clone();
        let relatives = self
            .blocking(move |fs| walk(fs, &walk_root, &skip))
            .await
            .map_err(|e| FileError::io(format!("{bucket}:"), e))?;

        let candidates: Vec<FileKey> = relatives
            .into_iter()
            .filter(|rel| patterns.is_match(rel))
            .map(|rel| FileKey::new(bucket, rel))
            .collect();

        let stats: Vec<(FileKey, Result<Timestamp, FileError>)> = stream::iter(candidates)
            .map(|key| async move {
                let ts = self.stat(&key).await;
                (key, ts)
            })
            .buffer_unordered(SCAN_STAT_LIMIT)
            .collect()
            .await;

        let mut keys = Vec::with_capacity(stats.len());
        for (key, ts) in stats {
            if !ts?.is_deleted() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Whether an event would change anything the store has observed.
    pub fn fs_event_useful(&self, event: &FsEvent) -> bool {
        let known = self.known_timestamp(&event.key);
        match event.kind {
            FsEventKind::Unlink => known != Some(Timestamp::DELETED),
            FsEventKind::Add | FsEventKind::Change => match (event.stat, known) {
                (Some(hint), Some(ts)) => hint != ts,
                _ => true,
            },
        }
    }

    /// Forget every cached timestamp and content so the next access of any
    /// path re-hits disk. Ownership of written files is kept.
    pub async fn invalidate(&self) {
        let slots: Vec<Arc<FileSlot>> = {
            let mut index = self.lock_index();
            index.known.clear();
            index.slots.values().cloned().collect()
        };
        for slot in slots {
            let mut state = slot.state.lock().await;
            state.timestamp = None;
            state.contents = None;
            state.err = None;
        }
    }

    /// Drop cached state for the event's path so the next access re-hits disk.
    pub async fn apply_fs_event(&self, event: &FsEvent) {
        let slot = self.slot(&event.key);
        let mut state = slot.state.lock().await;
        state.contents = None;
        state.err = None;
        match event.kind {
            FsEventKind::Unlink => {
                state.timestamp = Some(Timestamp::DELETED);
                self.set_known(&event.key, Timestamp::DELETED);
            }
            FsEventKind::Add | FsEventKind::Change => {
                state.timestamp = None;
                match event.stat {
                    Some(ts) => {
                        state.timestamp = Some(ts);
                        self.set_known(&event.key, ts);
                    }
                    None => {
                        if let Err(err) = self.stat_locked(&event.key, &mut state).await {
                            debug!(key = %event.key, "stat after event failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

/// Relative, forward-slashed paths of every file under `root`.
///
/// Walks by hand through [`FileSystem`] so the mock filesystem sees the same
/// traversal; callers match the result against a globset [`PatternSet`].
fn walk(fs: &dyn FileSystem, root: &Path, skip: &[PathBuf]) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs.read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            if entry.is_dir {
                if !skip.iter().any(|s| *s == entry.path) {
                    stack.push(entry.path);
                }
            } else if let Ok(rel) = entry.path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFileSystem;

    fn store(fs: &MockFileSystem) -> FileStore {
        let config = BuildConfig::new("/src", "/state").with_target("dev", "/dev");
        FileStore::new(Arc::new(fs.clone()), &config)
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_read() {
        let fs = MockFileSystem::new();
        fs.add_file("/src/a.txt", "1");
        let store = store(&fs);
        let key = FileKey::source("a.txt");

        let (a, b) = tokio::join!(store.get(&key), store.get(&key));
        assert_eq!(a.unwrap().contents(), b"1");
        assert_eq!(b.unwrap().contents(), b"1");
        assert_eq!(store.counters().reads, 1);
    }

    #[tokio::test]
    async fn known_deleted_short_circuits() {
        let fs = MockFileSystem::new();
        fs.add_dir("/src");
        let store = store(&fs);
        let key = FileKey::source("gone.txt");

        assert!(store.stat(&key).await.unwrap().is_deleted());
        assert!(store.get(&key).await.unwrap_err().is_missing());
        assert_eq!(store.counters().stats, 1);
        assert_eq!(store.counters().reads, 0);
    }

    #[tokio::test]
    async fn busy_reads_are_retried() {
        let fs = MockFileSystem::new();
        fs.add_file("/src/locked.txt", "data");
        fs.set_busy("/src/locked.txt", 2);
        let store = store(&fs);

        let file = store.get(&FileKey::source("locked.txt")).await.unwrap();
        assert_eq!(file.contents(), b"data");
        assert_eq!(store.counters().reads, 3);
    }

    #[tokio::test]
    async fn retry_budget_makes_error_sticky() {
        let fs = MockFileSystem::new();
        fs.add_file("/src/locked.txt", "data");
        fs.set_busy("/src/locked.txt", 100);
        let config = BuildConfig::new("/src", "/state").with_io(IoSection {
            read_retries: 2,
            busy_retry_ms: 1,
            backoff_ms: 1,
        });
        let store = FileStore::new(Arc::new(fs.clone()), &config);
        let key = FileKey::source("locked.txt");

        assert!(store.get(&key).await.is_err());
        let reads = store.counters().reads;
        assert_eq!(reads, 3);
        assert!(store.get(&key).await.is_err());
        assert_eq!(store.counters().reads, reads);

        store.apply_fs_event(&FsEvent::change(key.clone())).await;
        fs.set_busy("/src/locked.txt", 0);
        assert_eq!(store.get(&key).await.unwrap().contents(), b"data");
    }

    #[tokio::test]
    async fn put_detects_conflicting_owner() {
        let fs = MockFileSystem::new();
        let store = store(&fs);
        let key = FileKey::new("dev", "out.txt");

        store.put(&key, Arc::from(&b"a"[..]), "t:one").await.unwrap();
        let err = store.put(&key, Arc::from(&b"b"[..]), "t:two").await.unwrap_err();
        assert!(matches!(err, FileError::Conflict { .. }));
        assert_eq!(fs.contents(Path::new("/dev/out.txt")).unwrap(), b"a");
    }

    #[tokio::test]
    async fn identical_output_is_not_rewritten() {
        let fs = MockFileSystem::new();
        let store = store(&fs);
        let key = FileKey::new("dev", "out.txt");

        let first = store
            .put_output(&key, Arc::from(&b"same"[..]), "t:j", None)
            .await
            .unwrap();
        assert!(first.written);
        let second = store
            .put_output(&key, Arc::from(&b"same"[..]), "t:j", Some(&first.record()))
            .await
            .unwrap();
        assert!(!second.written);
        assert_eq!(second.ts, first.ts);
        assert_eq!(store.counters().writes, 1);
    }

    #[tokio::test]
    async fn prune_removes_empty_dirs_and_respects_owner() {
        let fs = MockFileSystem::new();
        fs.add_dir("/dev");
        let store = store(&fs);
        let key = FileKey::new("dev", "a/b.txt");
        store.put(&key, Arc::from(&b"x"[..]), "t:one").await.unwrap();

        assert!(!store.prune(&key, Some("t:other")).await.unwrap());
        assert!(fs.exists(Path::new("/dev/a/b.txt")));

        assert!(store.prune(&key, Some("t:one")).await.unwrap());
        assert!(!fs.exists(Path::new("/dev/a")));
        assert!(fs.exists(Path::new("/dev")));
        assert_eq!(store.known_timestamp(&key), Some(Timestamp::DELETED));
    }

    #[tokio::test]
    async fn scan_and_glob() {
        let fs = MockFileSystem::new();
        fs.add_file("/src/txt/a.txt", "a");
        fs.add_file("/src/txt/b.txt", "b");
        fs.add_file("/src/txt/skip.bin", "c");
        let mut store = store(&fs);
        store.add_bucket("copy", "/state/tasks/copy/out");
        let patterns = PatternSet::new(["txt/*.txt"]).unwrap();

        let keys = store.scan(SOURCE_BUCKET, &patterns).await.unwrap();
        assert_eq!(keys, vec![FileKey::source("txt/a.txt"), FileKey::source("txt/b.txt")]);

        store
            .put(&FileKey::new("copy", "txt/a.txt"), Arc::from(&b"a"[..]), "copy:j")
            .await
            .unwrap();
        assert_eq!(
            store.glob("copy", &patterns, Some("copy")),
            vec![FileKey::new("copy", "txt/a.txt")]
        );
    }

    #[tokio::test]
    async fn glob_filters_shared_target_by_producer() {
        let fs = MockFileSystem::new();
        fs.add_file("/dev/left.txt", "old");
        let store = store(&fs);
        let all = PatternSet::new(["**"]).unwrap();

        store
            .put(&FileKey::new("dev", "a.txt"), Arc::from(&b"a"[..]), "one:source:a.txt")
            .await
            .unwrap();
        store
            .put(&FileKey::new("dev", "b.txt"), Arc::from(&b"b"[..]), "two:source:b.txt")
            .await
            .unwrap();
        let left = FileKey::new("dev", "left.txt");
        store.stat(&left).await.unwrap();
        store.adopt([&left], "one:source:left.txt").await;

        assert_eq!(
            store.glob("dev", &all, Some("one")),
            vec![FileKey::new("dev", "a.txt"), left.clone()]
        );
        assert_eq!(store.glob("dev", &all, Some("two")), vec![FileKey::new("dev", "b.txt")]);
        assert_eq!(store.glob("dev", &all, None).len(), 3);

        assert!(store.prune(&left, None).await.unwrap());
        assert_eq!(store.owner_of(&left).as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn known_under_lists_existing_files_below_a_dir() {
        let fs = MockFileSystem::new();
        fs.add_file("/src/txt/a.txt", "a");
        fs.add_file("/src/txt/sub/b.txt", "b");
        fs.add_file("/src/txt2/c.txt", "c");
        let store = store(&fs);
        for rel in ["txt/a.txt", "txt/sub/b.txt", "txt2/c.txt", "txt/gone.txt"] {
            store.stat(&FileKey::source(rel)).await.unwrap();
        }

        assert_eq!(
            store.known_under(&FileKey::source("txt")),
            vec![FileKey::source("txt/a.txt"), FileKey::source("txt/sub/b.txt")]
        );
        assert_eq!(store.known_under(&FileKey::source("")).len(), 3);
        assert!(store.known_under(&FileKey::new("dev", "txt")).is_empty());
    }

    #[tokio::test]
    async fn event_usefulness_tracks_observed_timestamps() {
        let fs = MockFileSystem::new();
        let ts = fs.add_file("/src/a.txt", "1");
        let store = store(&fs);
        let key = FileKey::source("a.txt");
        store.stat(&key).await.unwrap();

        assert!(!store.fs_event_useful(&FsEvent::change(key.clone()).with_stat(ts)));
        assert!(store.fs_event_useful(&FsEvent::change(key.clone()).with_stat(Timestamp(ts.0 + 5))));
        assert!(store.fs_event_useful(&FsEvent::unlink(key.clone())));

        store.apply_fs_event(&FsEvent::unlink(key.clone())).await;
        assert!(!store.fs_event_useful(&FsEvent::unlink(key)));
    }

    #[test]
    fn locate_maps_paths_to_buckets() {
        let fs = MockFileSystem::new();
        let config = BuildConfig::new("/proj", "/proj/.gbstate").with_target("dev", "/proj/build/dev");
        let store = FileStore::new(Arc::new(fs), &config);

        assert_eq!(store.locate(Path::new("/proj/txt/a.txt")), Some(FileKey::source("txt/a.txt")));
        assert_eq!(
            store.locate(Path::new("/proj/build/dev/a.txt")),
            Some(FileKey::new("dev", "a.txt"))
        );
        assert_eq!(store.locate(Path::new("/proj/.gbstate/tasks/x/state.json")), None);
        assert_eq!(store.locate(Path::new("/elsewhere/a.txt")), None);
    }
}
