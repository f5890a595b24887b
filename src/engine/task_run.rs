// src/engine/task_run.rs

//! One run of one task, from input gathering to the last flushed job.
//!
//! The future owns the task's jobs while it runs and hands them back to the
//! engine in [`TaskRunOutput`], together with the output events dependent
//! tasks need to see.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt, stream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SOURCE_BUCKET;
use crate::errors::FileError;
use crate::files::{FileKey, FsEvent};
use crate::job::flush::retire_job;
use crate::job::run::{JobOutcome, JobRun, panic_message, run_job};
use crate::job::{ALL_JOB, Job, TaskContext};
use crate::types::{FsEventKind, TaskStatus, TaskType};
use crate::worker::{WorkerHandle, run_batch};

use super::EngineMsg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Done,
    Error(String),
    Aborted,
}

#[derive(Debug)]
pub(crate) struct TaskRunOutput {
    /// `None` when inputs could not be gathered; the next run rescans.
    pub jobs: Option<BTreeMap<String, Job>>,
    pub outcome: TaskOutcome,
    /// Changes to this task's outputs.
    pub events: Vec<FsEvent>,
}

pub(crate) struct TaskRunInput {
    pub uid: usize,
    pub run_id: u64,
    pub ctx: Arc<TaskContext>,
    /// Jobs from the previous run, or `None` for a full scan.
    pub jobs: Option<BTreeMap<String, Job>>,
    /// Filesystem events buffered since the previous run.
    pub events: Vec<FsEvent>,
    pub job_limit: usize,
    pub worker: Option<Arc<WorkerHandle>>,
    pub tx: mpsc::UnboundedSender<EngineMsg>,
}

/// Run a task and report the result to the engine.
pub(crate) async fn run_task(input: TaskRunInput) {
    let uid = input.uid;
    let run_id = input.run_id;
    let tx = input.tx.clone();
    let name = input.ctx.spec.name.clone();

    let output = match AssertUnwindSafe(run_task_inner(input)).catch_unwind().await {
        Ok(output) => output,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(task = %name, "task run panicked: {message}");
            TaskRunOutput {
                jobs: None,
                outcome: TaskOutcome::Error(format!("task run panicked: {message}")),
                events: Vec::new(),
            }
        }
    };

    if tx.send(EngineMsg::TaskFinished { uid, run_id, output }).is_err() {
        debug!(task = %name, "engine gone, dropping task result");
    }
}

fn progress(input: &TaskRunInput, status: TaskStatus) {
    let _ = input.tx.send(EngineMsg::TaskProgress {
        uid: input.uid,
        run_id: input.run_id,
        status,
    });
}

async fn run_task_inner(mut input: TaskRunInput) -> TaskRunOutput {
    let ctx = Arc::clone(&input.ctx);
    let spec = &ctx.spec;
    let carried = input.jobs.take();

    let aborted = |jobs: Option<BTreeMap<String, Job>>| TaskRunOutput {
        jobs,
        outcome: TaskOutcome::Aborted,
        events: Vec::new(),
    };
    let failed = |jobs: Option<BTreeMap<String, Job>>, message: String| {
        error!(task = %spec.name, "{message}");
        TaskRunOutput {
            jobs,
            outcome: TaskOutcome::Error(message),
            events: Vec::new(),
        }
    };

    if ctx.abort.is_triggered() {
        return aborted(carried);
    }
    if let Err(err) = ctx.state.load().await {
        return failed(carried, format!("loading job state: {err}"));
    }

    let events = std::mem::take(&mut input.events);
    let mut jobs = match carried {
        Some(mut jobs) => {
            apply_events(&ctx, &mut jobs, &events).await;
            jobs
        }
        None => match scan_jobs(&ctx).await {
            Ok(jobs) => jobs,
            Err(err) => return failed(None, format!("gathering inputs: {err}")),
        },
    };

    if ctx.abort.is_triggered() {
        return aborted(Some(jobs));
    }
    progress(&input, TaskStatus::PreparingDeps);

    // Jobs whose input vanished.
    let mut out_events = Vec::new();
    if spec.task_type == TaskType::Single {
        for name in ctx.state.job_names() {
            if jobs.contains_key(&name) {
                continue;
            }
            match retire_job(&ctx, &name).await {
                Ok(events) => out_events.extend(events),
                Err(err) => return failed(Some(jobs), format!("retiring job {name}: {err}")),
            }
        }
    }

    if ctx.abort.is_triggered() {
        return TaskRunOutput {
            jobs: Some(jobs),
            outcome: TaskOutcome::Aborted,
            events: out_events,
        };
    }
    progress(&input, TaskStatus::Running);

    let dirty = jobs.values().filter(|j| j.dirty).count();
    debug!(task = %spec.name, jobs = jobs.len(), dirty, "running jobs");

    let pending: Vec<Job> = std::mem::take(&mut jobs).into_values().collect();
    let (runs, batch_error) = match &input.worker {
        Some(worker) => {
            let batch = run_batch(&ctx, worker, pending).await;
            (batch.runs, batch.error)
        }
        None => {
            let runs: Vec<JobRun> = stream::iter(pending)
                .map(|job| run_job(Arc::clone(&ctx), job))
                .buffer_unordered(input.job_limit.max(1))
                .collect()
                .await;
            (runs, None)
        }
    };

    let mut failed_jobs = 0usize;
    let mut any_aborted = false;
    let mut task_error = batch_error;
    for run in runs {
        match run.outcome {
            JobOutcome::Executed { failed: true } => failed_jobs += 1,
            JobOutcome::Aborted => any_aborted = true,
            _ => {}
        }
        if task_error.is_none() {
            task_error = run.task_error;
        }
        out_events.extend(run.events);
        jobs.insert(run.job.name.clone(), run.job);
    }

    let outcome = if ctx.abort.is_triggered() {
        TaskOutcome::Aborted
    } else if let Some(message) = task_error {
        error!(task = %spec.name, "{message}");
        TaskOutcome::Error(message)
    } else if any_aborted {
        TaskOutcome::Aborted
    } else if failed_jobs > 0 {
        TaskOutcome::Error(format!("{failed_jobs} job(s) reported errors"))
    } else {
        TaskOutcome::Done
    };
    if outcome == TaskOutcome::Done && !out_events.is_empty() {
        info!(task = %spec.name, changed = out_events.len(), "task outputs changed");
    }

    TaskRunOutput {
        jobs: Some(jobs),
        outcome,
        events: out_events,
    }
}

/// Match every input glob and build the job map from scratch.
async fn scan_jobs(ctx: &TaskContext) -> Result<BTreeMap<String, Job>, FileError> {
    let mut keys: BTreeSet<FileKey> = BTreeSet::new();
    for input in &ctx.spec.inputs {
        let matched = if input.bucket == SOURCE_BUCKET {
            ctx.store.scan(SOURCE_BUCKET, &input.patterns).await?
        } else {
            ctx.store
                .glob(&input.bucket, &input.patterns, input.producer.as_deref())
        };
        keys.extend(matched);
    }
    debug!(task = %ctx.spec.name, files = keys.len(), "matched inputs");

    let mut jobs = BTreeMap::new();
    match ctx.spec.task_type {
        TaskType::Single => {
            for key in keys {
                let name = key.to_string();
                jobs.insert(name.clone(), Job::new(name, [key].into_iter().collect()));
            }
        }
        TaskType::All => {
            jobs.insert(ALL_JOB.to_string(), Job::new(ALL_JOB, keys));
        }
    }
    Ok(jobs)
}

/// Fold buffered filesystem events into an existing job map.
async fn apply_events(ctx: &TaskContext, jobs: &mut BTreeMap<String, Job>, events: &[FsEvent]) {
    // Last event per key wins.
    let mut latest: BTreeMap<&FileKey, &FsEvent> = BTreeMap::new();
    for event in events {
        latest.insert(&event.key, event);
    }

    for (key, event) in latest {
        let key_str = key.to_string();
        for name in ctx.state.jobs_referencing(&key_str) {
            if let Some(job) = jobs.get_mut(&name) {
                job.touch(key);
            }
        }

        if !ctx.spec.matches(key, ctx.store.owner_of(key).as_deref()) {
            continue;
        }
        let exists = match event.kind {
            FsEventKind::Unlink => false,
            FsEventKind::Add | FsEventKind::Change => match ctx.store.stat(key).await {
                Ok(ts) => !ts.is_deleted(),
                Err(err) => {
                    warn!(task = %ctx.spec.name, key = %key, "stat failed: {err}");
                    true
                }
            },
        };

        match ctx.spec.task_type {
            TaskType::Single => {
                if exists {
                    jobs.entry(key_str.clone())
                        .and_modify(|job| job.touch(key))
                        .or_insert_with(|| Job::new(key_str.clone(), [key.clone()].into_iter().collect()));
                } else {
                    jobs.remove(&key_str);
                }
            }
            TaskType::All => {
                let job = jobs
                    .entry(ALL_JOB.to_string())
                    .or_insert_with(|| Job::new(ALL_JOB, BTreeSet::new()));
                if exists {
                    job.add_input(key);
                } else {
                    job.remove_input(key);
                }
            }
        }
        debug!(task = %ctx.spec.name, key = %key, kind = ?event.kind, exists, "applied event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    // Job user data is held across awaits, so it has to stay Sync for the
    // task future to be spawnable.
    #[test]
    fn task_future_is_send() {
        let _check = |input: TaskRunInput| assert_send(&run_task(input));
    }
}
