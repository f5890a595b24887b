// src/job/mod.rs

//! Jobs: the units of work inside a task.
//!
//! A SINGLE task has one job per matched input file, named after the file's
//! key. An ALL task has one job named `"all"` over the whole input set.
//!
//! - [`handle`]: the API task functions program against.
//! - [`check`]: the incremental "is this job up to date" decision.
//! - [`flush`]: writing staged outputs and persisting the job state.
//! - [`run`]: the in-process execution path.

use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::dag::TaskSpec;
use crate::engine::{AbortToken, StatsCounters};
use crate::files::{FileKey, FileStore};
use crate::state::TaskState;

pub(crate) mod check;
pub(crate) mod flush;
pub mod handle;
pub(crate) mod run;

pub use handle::JobHandle;

/// Job name used by ALL tasks.
pub const ALL_JOB: &str = "all";

pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A task function. Called once per stale job.
pub type TaskFn = Arc<dyn Fn(JobHandle) -> TaskFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskFn`].
///
/// ```no_run
/// use watchbuild::job::task_fn;
///
/// let copy = task_fn(|job| async move {
///     let file = job.file()?;
///     job.out(file.relative(), file.contents())?;
///     Ok(())
/// });
/// ```
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(JobHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |job| f(job).boxed())
}

/// Wrap a synchronous closure as a [`TaskFn`].
pub fn sync_task_fn<F>(f: F) -> TaskFn
where
    F: Fn(&JobHandle) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |job| {
        let result = f(&job);
        futures::future::ready(result).boxed()
    })
}

/// Per-job bookkeeping owned by the engine between runs.
pub(crate) struct Job {
    pub name: String,
    pub base: BTreeSet<FileKey>,
    /// Base inputs changed since the last clean run.
    pub updated: BTreeSet<FileKey>,
    /// Base inputs removed since the last clean run (ALL jobs only).
    pub deleted: BTreeSet<FileKey>,
    pub dirty: bool,
    pub user_data: Option<Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("base", &self.base.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(name: impl Into<String>, base: BTreeSet<FileKey>) -> Self {
        Self {
            name: name.into(),
            updated: base.clone(),
            base,
            deleted: BTreeSet::new(),
            dirty: true,
            user_data: None,
        }
    }

    pub fn touch(&mut self, key: &FileKey) {
        self.dirty = true;
        self.updated.insert(key.clone());
    }

    pub fn add_input(&mut self, key: &FileKey) {
        self.base.insert(key.clone());
        self.deleted.remove(key);
        self.touch(key);
    }

    pub fn remove_input(&mut self, key: &FileKey) {
        if self.base.remove(key) {
            self.updated.remove(key);
            self.deleted.insert(key.clone());
            self.dirty = true;
        }
    }

    pub fn who(&self, task: &str) -> String {
        format!("{task}:{}", self.name)
    }
}

/// Shared context of one task's run, handed to every job.
pub(crate) struct TaskContext {
    pub spec: Arc<TaskSpec>,
    pub store: Arc<FileStore>,
    pub state: Arc<TaskState>,
    pub abort: AbortToken,
    pub limiter: Arc<Semaphore>,
    pub stats: Arc<StatsCounters>,
}
