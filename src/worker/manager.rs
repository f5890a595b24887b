// src/worker/manager.rs

//! The engine side of a worker: start it, feed it batches, serve its
//! dependency requests and flush what it returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::dag::TaskSpec;
use crate::errors::{BuildError, FileError, Result};
use crate::files::FileKey;
use crate::job::handle::{JobResult, StagedOutput};
use crate::job::run::{JobOutcome, JobRun, Preparation, PreparedJob, finish_job, prepare_job};
use crate::job::{Job, TaskContext};
use crate::logging::log_at;

use super::WorkerLink;
use super::child;
use super::protocol::{Message, WireFile, WireJob};

/// A running worker for one task. Dropping the last handle closes the link,
/// which ends the worker thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    task: String,
    link: Mutex<WorkerLink>,
}

/// Start a worker thread for `spec` and send it the task description.
pub(crate) fn spawn_worker(spec: &Arc<TaskSpec>) -> Result<Arc<WorkerHandle>> {
    let func = spec.func.clone().ok_or_else(|| {
        BuildError::Config(format!("task \"{}\" has no function to run on a worker", spec.name))
    })?;

    let (parent, worker) = WorkerLink::pair();
    child::spawn_thread(&spec.name, func, worker)?;
    parent.send(&Message::TaskInit {
        task: spec.name.clone(),
        task_type: spec.task_type,
        targets: spec.policy.targets.clone(),
        dep_buckets: spec.policy.dep_buckets.clone(),
    })?;
    debug!(task = %spec.name, "worker started");

    Ok(Arc::new(WorkerHandle {
        task: spec.name.clone(),
        link: Mutex::new(parent),
    }))
}

#[derive(Debug, Default)]
pub(crate) struct BatchOutput {
    pub runs: Vec<JobRun>,
    /// Set when the worker failed as a whole.
    pub error: Option<String>,
}

/// Check every job locally and send the stale ones to the worker as a single
/// batch. Returns once the worker reports the batch complete.
pub(crate) async fn run_batch(ctx: &Arc<TaskContext>, worker: &WorkerHandle, jobs: Vec<Job>) -> BatchOutput {
    let mut out = BatchOutput::default();
    let mut waiting: HashMap<String, (Job, PreparedJob)> = HashMap::new();
    let mut files: Vec<WireFile> = Vec::new();
    let mut index: HashMap<FileKey, usize> = HashMap::new();
    let mut wire_jobs = Vec::new();

    for mut job in jobs {
        let prepared = match prepare_job(ctx, &mut job).await {
            Preparation::UpToDate => {
                out.runs.push(JobRun::new(job, JobOutcome::UpToDate));
                continue;
            }
            Preparation::Aborted => {
                out.runs.push(JobRun::new(job, JobOutcome::Aborted));
                continue;
            }
            Preparation::Stale(prepared) => prepared,
        };

        let mut file_ids = Vec::with_capacity(prepared.files.len());
        let mut updated = Vec::new();
        for file in &prepared.files {
            let id = *index.entry(file.key().clone()).or_insert_with(|| {
                files.push(WireFile::from_file(file));
                files.len() - 1
            });
            file_ids.push(id);
            if job.updated.contains(file.key()) {
                updated.push(id);
            }
        }
        wire_jobs.push(WireJob {
            name: job.name.clone(),
            files: file_ids,
            updated,
            deleted: job.deleted.iter().map(ToString::to_string).collect(),
        });
        waiting.insert(job.name.clone(), (job, prepared));
    }

    if waiting.is_empty() {
        return out;
    }

    let mut link = worker.link.lock().await;
    debug!(task = %worker.task, jobs = wire_jobs.len(), files = files.len(), "sending batch to worker");
    if let Err(err) = link.send(&Message::TaskExecute { files, jobs: wire_jobs }) {
        out.error = Some(format!("worker for \"{}\" is unavailable: {err}", worker.task));
        abandon(&mut out, waiting);
        return out;
    }

    let mut abort_sent = false;
    loop {
        let received = tokio::select! {
            msg = link.recv() => msg,
            _ = ctx.abort.wait(), if !abort_sent => {
                abort_sent = true;
                if let Err(err) = link.send(&Message::Abort) {
                    debug!(task = %worker.task, "could not forward abort: {err}");
                }
                continue;
            }
        };
        let msg = match received {
            None => {
                out.error = Some(format!("worker for \"{}\" disconnected", worker.task));
                break;
            }
            Some(Err(err)) => {
                warn!(task = %worker.task, "unreadable message from worker: {err}");
                continue;
            }
            Some(Ok(msg)) => msg,
        };

        match msg {
            Message::JobDone {
                job: name,
                outputs,
                warnings,
                errors,
                deps,
                dep_reset,
                aborted,
            } => {
                let Some((job, prepared)) = waiting.remove(&name) else {
                    warn!(task = %worker.task, job = %name, "worker finished a job it was not given");
                    continue;
                };
                if aborted {
                    out.runs.push(JobRun::new(job, JobOutcome::Aborted));
                    continue;
                }
                let result = JobResult {
                    outputs: outputs
                        .into_iter()
                        .map(|o| {
                            let staged = match o.contents {
                                Some(bytes) => StagedOutput::Contents(Arc::from(bytes)),
                                None => StagedOutput::Unchanged,
                            };
                            (o.relative, staged)
                        })
                        .collect::<BTreeMap<_, _>>(),
                    warnings,
                    errors,
                    deps,
                    dep_reset,
                };
                out.runs.push(finish_job(ctx, job, prepared, result).await);
            }
            Message::JobDepAdd { id, job, key } => {
                trace!(task = %worker.task, job = %job, key = %key, "worker dependency request");
                let key = FileKey::parse(&key);
                let result = match ctx.store.get(&key).await {
                    Ok(file) => Ok(Some(WireFile::from_file(&file))),
                    Err(FileError::Missing(_)) => Ok(None),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(err) = link.send(&Message::Response { id, result }) {
                    debug!(task = %worker.task, "could not answer worker: {err}");
                }
            }
            Message::JobDepReset { job } => {
                trace!(task = %worker.task, job = %job, "dependencies reset");
            }
            Message::Log { level, job, message } => {
                log_at(level, &worker.task, &format!("{job}: {message}"));
            }
            Message::TaskComplete => break,
            other => warn!(task = %worker.task, ?other, "unexpected message from worker"),
        }
    }

    if !waiting.is_empty() && out.error.is_none() && !ctx.abort.is_triggered() {
        out.error = Some(format!(
            "worker for \"{}\" completed without reporting {} job(s)",
            worker.task,
            waiting.len()
        ));
    }
    abandon(&mut out, waiting);
    out
}

/// Jobs the worker never reported stay dirty for the next run.
fn abandon(out: &mut BatchOutput, waiting: HashMap<String, (Job, PreparedJob)>) {
    out.runs.extend(
        waiting
            .into_values()
            .map(|(job, _)| JobRun::new(job, JobOutcome::Aborted)),
    );
}
