// src/job/run.rs

//! Driving one job: decide, load, execute, flush.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, trace};

use crate::errors::FileError;
use crate::files::{BuildFile, FileKey, FileStore, FsEvent};
use crate::logging::log_at;
use crate::types::{LogLevel, Timestamp};

use super::check::check_up_to_date;
use super::flush::flush_job;
use super::handle::{JobHandle, JobHost, JobParts, JobResult};
use super::{Job, TaskContext, TaskFn};

/// How a job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    UpToDate,
    Executed { failed: bool },
    /// Interrupted by the abort flag; nothing was flushed.
    Aborted,
}

#[derive(Debug)]
pub(crate) struct JobRun {
    pub job: Job,
    pub outcome: JobOutcome,
    pub events: Vec<FsEvent>,
    /// Failure to persist the job's state; fails the whole task.
    pub task_error: Option<String>,
}

impl JobRun {
    pub(crate) fn new(job: Job, outcome: JobOutcome) -> Self {
        Self {
            job,
            outcome,
            events: Vec::new(),
            task_error: None,
        }
    }
}

/// A stale job with its inputs loaded, ready to hand to a task function.
#[derive(Debug)]
pub(crate) struct PreparedJob {
    pub files: Vec<BuildFile>,
    pub base_deps: BTreeMap<String, Timestamp>,
    pub invalid_outputs: BTreeSet<String>,
    /// Base inputs that could not be loaded.
    pub load_errors: Vec<String>,
}

pub(crate) enum Preparation {
    UpToDate,
    Aborted,
    Stale(PreparedJob),
}

/// Run the incremental check for a job and, when stale, load its inputs.
pub(crate) async fn prepare_job(ctx: &TaskContext, job: &mut Job) -> Preparation {
    if ctx.abort.is_triggered() {
        return Preparation::Aborted;
    }

    let last = ctx.state.job_state(&job.name);
    if !job.dirty && last.is_some() {
        trace!(task = %ctx.spec.name, job = %job.name, "job clean, not checked");
        return Preparation::UpToDate;
    }

    let stale = match check_up_to_date(&ctx.store, ctx.spec.version.as_deref(), job, last.as_ref()).await {
        Ok(()) => {
            debug!(task = %ctx.spec.name, job = %job.name, "job up to date");
            if let Some(last) = &last {
                let outputs: Vec<FileKey> = last.outputs.keys().map(|k| FileKey::parse(k)).collect();
                ctx.store.adopt(&outputs, &job.who(&ctx.spec.name)).await;
            }
            job.dirty = false;
            job.updated.clear();
            job.deleted.clear();
            return Preparation::UpToDate;
        }
        Err(stale) => stale,
    };
    debug!(task = %ctx.spec.name, job = %job.name, reason = %stale.reason, "job stale");

    let mut files = Vec::with_capacity(job.base.len());
    let mut base_deps = BTreeMap::new();
    let mut load_errors = Vec::new();
    for key in &job.base {
        match ctx.store.get(key).await {
            Ok(file) => {
                base_deps.insert(key.to_string(), file.timestamp());
                files.push(file);
            }
            Err(err) => {
                base_deps.insert(key.to_string(), Timestamp::DELETED);
                load_errors.push(err.to_string());
            }
        }
    }

    if ctx.abort.is_triggered() {
        return Preparation::Aborted;
    }

    Preparation::Stale(PreparedJob {
        files,
        base_deps,
        invalid_outputs: stale.invalid_outputs,
        load_errors,
    })
}

/// Record a finished job's results and persist them, unless an abort
/// arrived while it ran.
pub(crate) async fn finish_job(
    ctx: &TaskContext,
    mut job: Job,
    prepared: PreparedJob,
    mut result: JobResult,
) -> JobRun {
    if ctx.abort.is_triggered() {
        debug!(task = %ctx.spec.name, job = %job.name, "discarding results of aborted job");
        return JobRun::new(job, JobOutcome::Aborted);
    }
    result.errors.extend(prepared.load_errors);
    match flush_job(ctx, &mut job, result, prepared.base_deps, &prepared.invalid_outputs).await {
        Ok(flushed) => JobRun {
            job,
            outcome: JobOutcome::Executed {
                failed: flushed.failed,
            },
            events: flushed.events,
            task_error: None,
        },
        Err(err) => {
            error!(task = %ctx.spec.name, job = %job.name, "failed to save job state: {err}");
            JobRun {
                job,
                outcome: JobOutcome::Executed { failed: true },
                events: Vec::new(),
                task_error: Some(format!("saving job state: {err}")),
            }
        }
    }
}

/// Host for jobs executing inside the engine's process.
struct LocalHost {
    store: Arc<FileStore>,
    task: String,
}

impl JobHost for LocalHost {
    fn load(&self, key: FileKey) -> BoxFuture<'_, Result<BuildFile, FileError>> {
        async move { self.store.get(&key).await }.boxed()
    }

    fn dep_reset(&self, job: &str) {
        trace!(task = %self.task, job = %job, "dependencies reset");
    }

    fn log(&self, level: LogLevel, job: &str, message: &str) {
        log_at(level, &self.task, &format!("{job}: {message}"));
    }
}

/// Execute a task function for one job and collect what it staged.
///
/// Errors returned by the function and panics are both recorded as job
/// errors.
pub(crate) async fn execute_function(
    ctx: &TaskContext,
    job: &mut Job,
    files: Vec<BuildFile>,
) -> JobResult {
    let Some(func) = ctx.spec.func.clone() else {
        return JobResult::default();
    };

    let handle = JobHandle::new(JobParts {
        task: ctx.spec.name.clone(),
        job: job.name.clone(),
        task_type: ctx.spec.task_type,
        files,
        updated: job.updated.clone(),
        deleted: job.deleted.iter().cloned().collect(),
        policy: Arc::clone(&ctx.spec.policy),
        host: Arc::new(LocalHost {
            store: Arc::clone(&ctx.store),
            task: ctx.spec.name.clone(),
        }),
        user_data: job.user_data.take(),
    });

    invoke(&func, &handle).await;
    job.user_data = handle.take_user_data();
    handle.take_result()
}

/// Call a task function, recording a returned error or a panic as a job
/// error on the handle.
pub(crate) async fn invoke(func: &TaskFn, handle: &JobHandle) {
    let call = AssertUnwindSafe(func(handle.clone())).catch_unwind();
    match call.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => handle.error(format!("{err:#}")),
        Err(panic) => handle.error(format!("task function panicked: {}", panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Check, execute and flush one job in-process.
pub(crate) async fn run_job(ctx: Arc<TaskContext>, mut job: Job) -> JobRun {
    let prepared = match prepare_job(&ctx, &mut job).await {
        Preparation::UpToDate => return JobRun::new(job, JobOutcome::UpToDate),
        Preparation::Aborted => return JobRun::new(job, JobOutcome::Aborted),
        Preparation::Stale(prepared) => prepared,
    };

    let _permit = ctx.limiter.acquire().await;
    if ctx.abort.is_triggered() {
        return JobRun::new(job, JobOutcome::Aborted);
    }

    debug!(task = %ctx.spec.name, job = %job.name, "running job");
    let files = prepared.files.clone();
    let result = execute_function(&ctx, &mut job, files).await;
    finish_job(&ctx, job, prepared, result).await
}
