// src/job/handle.rs

//! The handle task functions use to read inputs, declare dynamic
//! dependencies, stage outputs and report problems.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::config::SOURCE_BUCKET;
use crate::errors::{FileError, JobError};
use crate::files::{BuildFile, FileKey};
use crate::types::{LogLevel, TaskType, Timestamp};

/// Where a job's dynamic dependencies come from and where its log lines go.
///
/// In-process jobs talk to the file store directly; jobs on a worker proxy
/// every request to the parent, which alone owns the store.
pub(crate) trait JobHost: Send + Sync {
    fn load(&self, key: FileKey) -> BoxFuture<'_, Result<BuildFile, FileError>>;

    fn dep_reset(&self, job: &str);

    fn log(&self, level: LogLevel, job: &str, message: &str);
}

/// Which buckets a job may reference with `dep_add`.
#[derive(Debug, Clone, Default)]
pub(crate) struct BucketPolicy {
    pub targets: BTreeSet<String>,
    /// Dependency task name -> the bucket it writes to.
    pub dep_buckets: BTreeMap<String, String>,
}

impl BucketPolicy {
    /// Resolve a referenced key to the bucket it really lives in, or `None`
    /// if the bucket is not one the task may read.
    pub fn resolve(&self, key: FileKey) -> Option<FileKey> {
        let bucket = key.bucket();
        if bucket == SOURCE_BUCKET || self.targets.contains(bucket) {
            return Some(key);
        }
        self.dep_buckets
            .get(bucket)
            .map(|out| FileKey::new(out.clone(), key.relative()))
    }
}

/// A staged output.
#[derive(Debug, Clone)]
pub(crate) enum StagedOutput {
    Contents(Arc<[u8]>),
    /// Same bytes as the previous run; reuse the previous record.
    Unchanged,
}

/// Everything a task function produced, collected after it returns.
#[derive(Debug, Default)]
pub(crate) struct JobResult {
    pub outputs: BTreeMap<String, StagedOutput>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub deps: BTreeMap<String, Timestamp>,
    pub dep_reset: bool,
}

type PendingLoad = Shared<BoxFuture<'static, Result<BuildFile, FileError>>>;

#[derive(Default)]
struct Scratch {
    result: JobResult,
    dep_files: HashMap<FileKey, BuildFile>,
    /// Loads in flight, shared by concurrent requests for the same key.
    loading: HashMap<FileKey, PendingLoad>,
}

pub(crate) struct JobParts {
    pub task: String,
    pub job: String,
    pub task_type: TaskType,
    pub files: Vec<BuildFile>,
    pub updated: BTreeSet<FileKey>,
    pub deleted: Vec<FileKey>,
    pub policy: Arc<BucketPolicy>,
    pub host: Arc<dyn JobHost>,
    pub user_data: Option<Box<dyn Any + Send + Sync>>,
}

struct JobContext {
    task: String,
    job: String,
    task_type: TaskType,
    files: Vec<BuildFile>,
    updated: BTreeSet<FileKey>,
    deleted: Vec<FileKey>,
    policy: Arc<BucketPolicy>,
    host: Arc<dyn JobHost>,
    scratch: Mutex<Scratch>,
    user_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

/// Handle passed to a task function for one job.
///
/// Cloning is cheap; all clones refer to the same job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobContext>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("task", &self.inner.task)
            .field("job", &self.inner.job)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub(crate) fn new(parts: JobParts) -> Self {
        Self {
            inner: Arc::new(JobContext {
                task: parts.task,
                job: parts.job,
                task_type: parts.task_type,
                files: parts.files,
                updated: parts.updated,
                deleted: parts.deleted,
                policy: parts.policy,
                host: parts.host,
                scratch: Mutex::new(Scratch::default()),
                user_data: Mutex::new(parts.user_data),
            }),
        }
    }

    fn scratch(&self) -> MutexGuard<'_, Scratch> {
        self.inner.scratch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Job name: the input key for SINGLE tasks, `"all"` for ALL tasks.
    pub fn name(&self) -> &str {
        &self.inner.job
    }

    pub fn task_name(&self) -> &str {
        &self.inner.task
    }

    /// The input of a SINGLE job.
    pub fn file(&self) -> Result<&BuildFile, JobError> {
        match (self.inner.task_type, self.inner.files.as_slice()) {
            (TaskType::Single, [file]) => Ok(file),
            _ => Err(JobError::NoSingleInput),
        }
    }

    /// Every base input of the job.
    pub fn files(&self) -> &[BuildFile] {
        &self.inner.files
    }

    /// Base inputs that changed since the job last ran cleanly.
    pub fn files_updated(&self) -> Vec<&BuildFile> {
        self.inner
            .files
            .iter()
            .filter(|f| self.inner.updated.contains(f.key()))
            .collect()
    }

    /// Base inputs that disappeared since the job last ran cleanly.
    pub fn files_deleted(&self) -> &[FileKey] {
        &self.inner.deleted
    }

    pub fn is_updated(&self, key: &FileKey) -> bool {
        self.inner.updated.contains(key)
    }

    /// Stage an output at `relative` inside the task's output bucket.
    ///
    /// Nothing is written until the task function returns.
    pub fn out(&self, relative: impl Into<String>, contents: impl Into<Vec<u8>>) -> Result<(), JobError> {
        let contents: Arc<[u8]> = Arc::from(contents.into());
        self.stage(relative.into(), StagedOutput::Contents(contents))
    }

    /// Declare an output identical to the one recorded by the previous run.
    pub fn out_unchanged(&self, relative: impl Into<String>) -> Result<(), JobError> {
        self.stage(relative.into(), StagedOutput::Unchanged)
    }

    fn stage(&self, relative: String, output: StagedOutput) -> Result<(), JobError> {
        let duplicate = {
            let mut scratch = self.scratch();
            if scratch.result.outputs.contains_key(&relative) {
                true
            } else {
                scratch.result.outputs.insert(relative.clone(), output);
                false
            }
        };
        if duplicate {
            let err = JobError::DuplicateOutput(relative);
            self.error(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.host.log(LogLevel::Warn, &self.inner.job, &message);
        self.scratch().result.warnings.push(message);
    }

    pub fn warn_on(&self, file: &FileKey, message: impl AsRef<str>) {
        self.warn(format!("{file}: {}", message.as_ref()));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        self.inner.host.log(LogLevel::Error, &self.inner.job, &message);
        self.scratch().result.errors.push(message);
    }

    pub fn error_on(&self, file: &FileKey, message: impl AsRef<str>) {
        self.error(format!("{file}: {}", message.as_ref()));
    }

    /// Declare and load a dynamic dependency. A missing file is a job error.
    pub async fn dep_add(&self, name: &str) -> Result<BuildFile, JobError> {
        match self.load_dep(name).await? {
            Some(file) => Ok(file),
            None => {
                let err = JobError::File(FileError::Missing(name.to_string()));
                self.error(err.to_string());
                Err(err)
            }
        }
    }

    /// Declare a dependency that is allowed to be missing. Its absence is
    /// still recorded, so the job re-runs once the file appears.
    pub async fn dep_add_optional(&self, name: &str) -> Result<Option<BuildFile>, JobError> {
        self.load_dep(name).await
    }

    async fn load_dep(&self, name: &str) -> Result<Option<BuildFile>, JobError> {
        let requested = FileKey::parse(name);
        let Some(key) = self.inner.policy.resolve(requested.clone()) else {
            let err = JobError::UndeclaredDependency {
                job: self.inner.job.clone(),
                key: requested.to_string(),
                bucket: requested.bucket().to_string(),
            };
            self.error(err.to_string());
            return Err(err);
        };

        let pending = {
            let mut scratch = self.scratch();
            if let Some(file) = scratch.dep_files.get(&key) {
                return Ok(Some(file.clone()));
            }
            scratch
                .loading
                .entry(key.clone())
                .or_insert_with(|| {
                    let host = Arc::clone(&self.inner.host);
                    let key = key.clone();
                    async move { host.load(key).await }.boxed().shared()
                })
                .clone()
        };
        let loaded = pending.await;

        let mut scratch = self.scratch();
        scratch.loading.remove(&key);
        match loaded {
            Ok(file) => {
                scratch.result.deps.insert(key.to_string(), file.timestamp());
                scratch.dep_files.insert(key, file.clone());
                Ok(Some(file))
            }
            Err(FileError::Missing(_)) => {
                scratch.result.deps.insert(key.to_string(), Timestamp::DELETED);
                Ok(None)
            }
            Err(err) => {
                let first = scratch
                    .result
                    .deps
                    .insert(key.to_string(), Timestamp::DELETED)
                    .is_none();
                drop(scratch);
                if first {
                    self.error(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Forget dynamic dependencies recorded by earlier runs; the function is
    /// about to re-declare the ones it still needs.
    pub fn dep_reset(&self) {
        self.inner.host.dep_reset(&self.inner.job);
        let mut scratch = self.scratch();
        scratch.result.dep_reset = true;
        scratch.result.deps.clear();
        scratch.dep_files.clear();
        scratch.loading.clear();
    }

    /// Access per-job data that survives between runs of this job in one
    /// process. A value of a different type is replaced by `T::default()`.
    pub fn with_user_data<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + Send + Sync + 'static,
    {
        let mut slot = self.inner.user_data.lock().unwrap_or_else(|e| e.into_inner());
        let is_t = slot.as_ref().is_some_and(|b| b.is::<T>());
        if !is_t {
            *slot = Some(Box::new(T::default()));
        }
        match slot.as_mut().and_then(|b| b.downcast_mut::<T>()) {
            Some(value) => f(value),
            None => f(&mut T::default()),
        }
    }

    pub(crate) fn take_result(&self) -> JobResult {
        std::mem::take(&mut self.scratch().result)
    }

    pub(crate) fn take_user_data(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.inner
            .user_data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapHost {
        files: HashMap<FileKey, BuildFile>,
        loads: AtomicUsize,
    }

    impl JobHost for MapHost {
        fn load(&self, key: FileKey) -> BoxFuture<'_, Result<BuildFile, FileError>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let found = self.files.get(&key).cloned();
            Box::pin(async move {
                tokio::task::yield_now().await;
                found.ok_or_else(|| FileError::Missing(key.to_string()))
            })
        }

        fn dep_reset(&self, _job: &str) {}

        fn log(&self, _level: LogLevel, _job: &str, _message: &str) {}
    }

    fn handle(files: Vec<BuildFile>, host_files: Vec<BuildFile>) -> JobHandle {
        handle_with_host(files, host_files).0
    }

    fn handle_with_host(files: Vec<BuildFile>, host_files: Vec<BuildFile>) -> (JobHandle, Arc<MapHost>) {
        let host = Arc::new(MapHost {
            files: host_files
                .into_iter()
                .map(|f| (f.key().clone(), f))
                .collect(),
            loads: AtomicUsize::new(0),
        });
        let mut policy = BucketPolicy::default();
        policy.targets.insert("dev".to_string());
        policy
            .dep_buckets
            .insert("copy".to_string(), "copy".to_string());
        let job = JobHandle::new(JobParts {
            task: "t".to_string(),
            job: "all".to_string(),
            task_type: TaskType::All,
            updated: files.iter().map(|f| f.key().clone()).collect(),
            files,
            deleted: Vec::new(),
            policy: Arc::new(policy),
            host: Arc::clone(&host) as Arc<dyn JobHost>,
            user_data: None,
        });
        (job, host)
    }

    fn file(key: &str, ts: i64, body: &str) -> BuildFile {
        BuildFile::new(FileKey::parse(key), Timestamp(ts), Arc::from(body.as_bytes()))
    }

    #[test]
    fn duplicate_output_is_a_job_error() {
        let job = handle(vec![], vec![]);
        job.out("a.txt", "1").unwrap();
        assert!(matches!(job.out("a.txt", "2"), Err(JobError::DuplicateOutput(_))));
        let result = job.take_result();
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn dep_add_records_timestamps_and_missing() {
        let job = handle(vec![], vec![file("copy:m.json", 7, "{}")]);
        let dep = job.dep_add("copy:m.json").await.unwrap();
        assert_eq!(dep.contents(), b"{}");
        assert!(job.dep_add_optional("other.txt").await.unwrap().is_none());
        assert!(job.dep_add("gone.txt").await.is_err());

        let result = job.take_result();
        assert_eq!(result.deps.get("copy:m.json"), Some(&Timestamp(7)));
        assert_eq!(result.deps.get("source:other.txt"), Some(&Timestamp::DELETED));
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_dep_adds_share_one_load() {
        let (job, host) = handle_with_host(vec![], vec![file("layout.html", 3, "<main>")]);
        let (a, b) = tokio::join!(job.dep_add("layout.html"), job.dep_add("layout.html"));
        assert_eq!(a.unwrap().contents(), b"<main>");
        assert_eq!(b.unwrap().contents(), b"<main>");
        assert_eq!(host.loads.load(Ordering::SeqCst), 1);

        job.dep_add("layout.html").await.unwrap();
        assert_eq!(host.loads.load(Ordering::SeqCst), 1);
        assert_eq!(job.take_result().deps.len(), 1);
    }

    #[tokio::test]
    async fn undeclared_bucket_is_rejected() {
        let job = handle(vec![], vec![]);
        let err = job.dep_add("elsewhere:x.txt").await.unwrap_err();
        assert!(matches!(err, JobError::UndeclaredDependency { .. }));
        assert_eq!(job.take_result().errors.len(), 1);
    }

    #[test]
    fn file_requires_single_task() {
        let job = handle(vec![file("a.txt", 1, "a")], vec![]);
        assert!(job.file().is_err());
        assert_eq!(job.files().len(), 1);
        assert_eq!(job.files_updated().len(), 1);
    }

    #[test]
    fn user_data_persists_through_handle() {
        let job = handle(vec![], vec![]);
        job.with_user_data(|count: &mut u32| *count += 2);
        let total = job.with_user_data(|count: &mut u32| *count);
        assert_eq!(total, 2);
        assert!(job.take_user_data().is_some());
    }
}
