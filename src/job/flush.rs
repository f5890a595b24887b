// src/job/flush.rs

//! Writing a finished job's outputs and persisting its new state.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::errors::Result;
use crate::files::{FileKey, FsEvent};
use crate::state::{JobState, OutputRecord};
use crate::types::Timestamp;

use super::handle::{JobResult, StagedOutput};
use super::{Job, TaskContext};

/// What flushing a job changed on disk.
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    /// Change/unlink events for dependent tasks.
    pub events: Vec<FsEvent>,
    /// The job finished with errors (its own or from writing outputs).
    pub failed: bool,
}

/// Flush staged outputs, prune outputs the job no longer produces and save
/// the job's new state.
///
/// `base_deps` are the timestamps of the base inputs the function saw.
/// `invalid_outputs` are previous outputs whose hash must not be trusted.
pub(crate) async fn flush_job(
    ctx: &TaskContext,
    job: &mut Job,
    mut result: JobResult,
    base_deps: BTreeMap<String, Timestamp>,
    invalid_outputs: &BTreeSet<String>,
) -> Result<FlushOutcome> {
    let spec = &ctx.spec;
    let who = job.who(&spec.name);
    let last = ctx.state.job_state(&job.name).unwrap_or_default();
    let mut events = Vec::new();
    let mut outputs: BTreeMap<String, OutputRecord> = BTreeMap::new();

    for (relative, staged) in std::mem::take(&mut result.outputs) {
        let key = FileKey::new(spec.output_bucket.clone(), relative);
        let key_str = key.to_string();
        let previous = last.outputs.get(&key_str);

        let recorded = match staged {
            StagedOutput::Contents(contents) => {
                let trusted = previous.filter(|_| !invalid_outputs.contains(&key_str));
                match ctx.store.put_output(&key, contents, &who, trusted).await {
                    Ok(outcome) => {
                        if outcome.written {
                            ctx.stats.file_updated();
                            events.push(FsEvent::change(key.clone()).with_stat(outcome.ts));
                        }
                        Ok(outcome.record())
                    }
                    Err(err) => Err(err.to_string()),
                }
            }
            StagedOutput::Unchanged => match previous {
                Some(prev) => match ctx.store.claim(&key, &who).await {
                    Ok(ts) => Ok(OutputRecord {
                        ts,
                        hash: prev.hash.clone(),
                    }),
                    Err(err) => Err(err.to_string()),
                },
                None => Err(format!("{key}: declared unchanged but has no previous output")),
            },
        };

        match recorded {
            Ok(record) => {
                outputs.insert(key_str, record);
            }
            Err(message) => {
                warn!(task = %spec.name, job = %job.name, "output failed: {message}");
                result.errors.push(message);
            }
        }
    }

    let failed = !result.errors.is_empty();

    for (key_str, record) in &last.outputs {
        if outputs.contains_key(key_str) {
            continue;
        }
        if failed {
            // Kept in the record so a later clean run still prunes it.
            outputs.insert(key_str.clone(), record.clone());
            continue;
        }
        let key = FileKey::parse(key_str);
        match ctx.store.prune(&key, Some(&who)).await {
            Ok(true) => {
                ctx.stats.file_deleted();
                events.push(FsEvent::unlink(key));
            }
            Ok(false) => {}
            Err(err) => warn!(task = %spec.name, job = %job.name, key = %key, "failed to prune output: {err}"),
        }
    }

    let mut deps = base_deps;
    if !result.dep_reset {
        for (key_str, ts) in &last.deps {
            if deps.contains_key(key_str) {
                continue;
            }
            let key = FileKey::parse(key_str);
            // Former base inputs are gone from the job, not dynamic deps.
            if spec.matches(&key, ctx.store.owner_of(&key).as_deref()) {
                continue;
            }
            let current = ctx.store.known_timestamp(&key).unwrap_or(*ts);
            deps.insert(key_str.clone(), current);
        }
    }
    deps.append(&mut result.deps);

    ctx.stats.job_finished(result.warnings.len(), result.errors.len());

    let state = JobState {
        deps,
        outputs,
        errors: result.errors,
        warnings: result.warnings,
        version: spec.version.clone(),
    };
    let clean = !state.has_problems();
    ctx.state.set_job_state(&job.name, Some(state)).await?;

    if clean {
        job.updated.clear();
        job.deleted.clear();
        job.dirty = false;
    }
    debug!(task = %spec.name, job = %job.name, clean, events = events.len(), "flushed job");

    Ok(FlushOutcome { events, failed })
}

/// Remove a job whose input disappeared: prune its recorded outputs and drop
/// its state.
pub(crate) async fn retire_job(ctx: &TaskContext, name: &str) -> Result<Vec<FsEvent>> {
    let who = format!("{}:{name}", ctx.spec.name);
    let mut events = Vec::new();
    if let Some(last) = ctx.state.job_state(name) {
        for key_str in last.outputs.keys() {
            let key = FileKey::parse(key_str);
            match ctx.store.prune(&key, Some(&who)).await {
                Ok(true) => {
                    ctx.stats.file_deleted();
                    events.push(FsEvent::unlink(key));
                }
                Ok(false) => {}
                Err(err) => warn!(task = %ctx.spec.name, job = %name, key = %key, "failed to prune output: {err}"),
            }
        }
    }
    debug!(task = %ctx.spec.name, job = %name, pruned = events.len(), "retired job");
    ctx.state.set_job_state(name, None).await?;
    Ok(events)
}
