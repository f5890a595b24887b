// src/engine/runtime.rs

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::config::BuildConfig;
use crate::errors::{BuildError, Result};
use crate::files::{FileKey, FileStore, FsCountersSnapshot, FsEvent, PatternSet};
use crate::job::TaskContext;
use crate::job::flush::retire_job;
use crate::types::{ExecMode, TaskStatus};
use crate::worker::{WorkerHandle, spawn_worker};

use super::core::Core;
use super::task_run::{TaskOutcome, TaskRunInput, TaskRunOutput, run_task};
use super::{
    AbortToken, CleanReport, EngineMsg, EngineState, EventDisposition, RunSummary, StatsCounters,
};

/// The engine actor.
///
/// Processes one message at a time and, after each, settles: finishes an
/// abort once nothing is in flight, starts whatever tasks may start and
/// publishes a summary when every active task is terminal.
pub(crate) struct Runtime {
    core: Core,
    config: Arc<BuildConfig>,
    store: Arc<FileStore>,
    rx: mpsc::UnboundedReceiver<EngineMsg>,
    /// Weak so the loop ends once every handle and task run is gone.
    tx: mpsc::WeakUnboundedSender<EngineMsg>,
    abort: AbortToken,
    aborting: bool,
    /// Events that triggered the current abort, applied once it settles.
    held: Vec<FsEvent>,
    /// Events no active task cares about, applied at the next idle point.
    deferred: Vec<FsEvent>,
    limiter: Arc<Semaphore>,
    stats: Arc<StatsCounters>,
    fs_mark: FsCountersSnapshot,
    state_tx: watch::Sender<EngineState>,
    running: bool,
    run_counter: u64,
    workers: HashMap<usize, Arc<WorkerHandle>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("aborting", &self.aborting)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        core: Core,
        config: Arc<BuildConfig>,
        store: Arc<FileStore>,
        rx: mpsc::UnboundedReceiver<EngineMsg>,
        tx: mpsc::WeakUnboundedSender<EngineMsg>,
        state_tx: watch::Sender<EngineState>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.limits.jobs.max(1)));
        let fs_mark = store.counters();
        Self {
            core,
            config,
            store,
            rx,
            tx,
            abort: AbortToken::new(),
            aborting: false,
            held: Vec::new(),
            deferred: Vec::new(),
            limiter,
            stats: Arc::new(StatsCounters::default()),
            fs_mark,
            state_tx,
            running: false,
            run_counter: 0,
            workers: HashMap::new(),
        }
    }

    /// Main loop. Returns when stopped or when every handle is dropped.
    pub async fn run(mut self) {
        info!("build engine started");

        while let Some(msg) = self.rx.recv().await {
            trace!(?msg, "engine received message");
            if !self.handle(msg).await {
                info!("stop requested");
                break;
            }
            self.settle().await;
        }

        // Let in-flight jobs wind down instead of flushing.
        self.abort.trigger();
        info!("build engine stopped");
    }

    async fn handle(&mut self, msg: EngineMsg) -> bool {
        match msg {
            EngineMsg::Activate { tasks, reply } => {
                let result = self.activate(&tasks).await;
                let _ = reply.send(result);
            }
            EngineMsg::FsEvent { event, reply } => {
                let disposition = self.fs_event(event);
                if let Some(reply) = reply {
                    let _ = reply.send(disposition);
                }
            }
            EngineMsg::TaskProgress { uid, run_id, status } => {
                let slot = &mut self.core.slots[uid];
                if slot.run_id == run_id && slot.status.is_in_flight() {
                    debug!(task = %slot.spec.name, status = %status, "task progressed");
                    slot.status = status;
                }
            }
            EngineMsg::TaskFinished { uid, run_id, output } => {
                self.task_finished(uid, run_id, output);
            }
            EngineMsg::Status { task, reply } => {
                let _ = reply.send(self.core.slot_by_name(&task).map(|s| s.status));
            }
            EngineMsg::Clean { tasks, force, reply } => {
                let result = self.clean(&tasks, force).await;
                let _ = reply.send(result);
            }
            EngineMsg::Stop => return false,
        }
        true
    }

    fn set_running(&mut self) {
        if !self.running {
            self.running = true;
            self.state_tx.send_modify(|s| s.running = true);
        }
    }

    async fn activate(&mut self, tasks: &[String]) -> Result<()> {
        self.core.activate(tasks)?;
        // Without a watcher nothing else tells the store about edits made
        // between runs.
        self.store.invalidate().await;
        self.deferred.clear();
        self.stats.take();
        self.fs_mark = self.store.counters();
        self.set_running();
        Ok(())
    }

    fn fs_event(&mut self, event: FsEvent) -> EventDisposition {
        if !self.store.fs_event_useful(&event) {
            trace!(key = %event.key, kind = ?event.kind, "ignoring event that changes nothing");
            return EventDisposition::Ignored;
        }

        let owner = self.store.owner_of(&event.key);
        let impacted = self.core.impacted(&event.key, owner.as_deref());
        if impacted.is_empty() {
            debug!(key = %event.key, kind = ?event.kind, "deferring event, no active task affected");
            self.deferred.push(event);
            return EventDisposition::Deferred;
        }

        let mut names = Vec::with_capacity(impacted.len());
        for uid in impacted {
            let slot = &mut self.core.slots[uid];
            slot.flagged = true;
            names.push(slot.spec.name.clone());
        }
        info!(key = %event.key, kind = ?event.kind, tasks = ?names, "change detected");
        self.held.push(event);

        if !self.aborting {
            self.aborting = true;
            self.abort.trigger();
            if self.core.any_in_flight() {
                info!("aborting in-flight work");
            }
        }
        self.set_running();
        EventDisposition::Impacted(names)
    }

    async fn settle(&mut self) {
        loop {
            if self.aborting {
                if self.core.any_in_flight() {
                    return;
                }
                self.finish_abort().await;
            }

            if !self.deferred.is_empty() && !self.core.any_in_flight() {
                for event in std::mem::take(&mut self.deferred) {
                    self.store.apply_fs_event(&event).await;
                }
            }

            let start = self.core.advance(self.aborting);
            if start.is_empty() {
                break;
            }
            for uid in start {
                self.start_task(uid);
            }
        }

        if self.running && self.core.all_active_terminal() {
            self.emit_done();
        }
    }

    async fn finish_abort(&mut self) {
        let held = std::mem::take(&mut self.held);
        let deferred = std::mem::take(&mut self.deferred);
        for event in held.iter().chain(deferred.iter()) {
            self.store.apply_fs_event(event).await;
        }
        for event in &held {
            let owner = self.store.owner_of(&event.key);
            self.core.route_event(event, owner.as_deref());
        }

        let reset = self.core.reset_after_abort();
        self.aborting = false;
        self.abort.reset();
        info!(events = held.len(), tasks = ?reset, "resuming after change");
    }

    fn context(&self, uid: usize) -> Arc<TaskContext> {
        let slot = &self.core.slots[uid];
        Arc::new(TaskContext {
            spec: Arc::clone(&slot.spec),
            store: Arc::clone(&self.store),
            state: Arc::clone(&slot.state),
            abort: self.abort.clone(),
            limiter: Arc::clone(&self.limiter),
            stats: Arc::clone(&self.stats),
        })
    }

    fn worker_for(&mut self, uid: usize) -> Result<Arc<WorkerHandle>> {
        if let Some(worker) = self.workers.get(&uid) {
            return Ok(Arc::clone(worker));
        }
        let worker = spawn_worker(&self.core.slots[uid].spec)?;
        self.workers.insert(uid, Arc::clone(&worker));
        Ok(worker)
    }

    fn start_task(&mut self, uid: usize) {
        let worker = if self.core.exec_of(uid) == ExecMode::Worker {
            match self.worker_for(uid) {
                Ok(worker) => Some(worker),
                Err(err) => {
                    let slot = &mut self.core.slots[uid];
                    error!(task = %slot.spec.name, "failed to start worker: {err}");
                    slot.status = TaskStatus::Error;
                    slot.error = Some(err.to_string());
                    return;
                }
            }
        } else {
            None
        };

        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.run_counter += 1;
        let run_id = self.run_counter;
        let ctx = self.context(uid);
        let slot = &mut self.core.slots[uid];
        slot.run_id = run_id;
        info!(task = %slot.spec.name, run_id, phase = slot.spec.phase, "task started");
        let span = info_span!("task", task = %slot.spec.name, run_id);

        let input = TaskRunInput {
            uid,
            run_id,
            ctx,
            jobs: slot.jobs.take(),
            events: std::mem::take(&mut slot.events),
            job_limit: self.config.limits.jobs,
            worker,
            tx,
        };
        tokio::spawn(run_task(input).instrument(span));
    }

    fn task_finished(&mut self, uid: usize, run_id: u64, output: TaskRunOutput) {
        let slot = &mut self.core.slots[uid];
        if slot.run_id != run_id || !slot.status.is_in_flight() {
            debug!(task = %slot.spec.name, run_id, "ignoring result of a stale run");
            return;
        }

        slot.jobs = output.jobs;
        match output.outcome {
            TaskOutcome::Done => {
                info!(task = %slot.spec.name, run_id, "task done");
                slot.status = TaskStatus::Done;
            }
            TaskOutcome::Error(message) => {
                error!(task = %slot.spec.name, run_id, "task failed: {message}");
                slot.status = TaskStatus::Error;
                slot.error = Some(message);
            }
            TaskOutcome::Aborted => {
                info!(task = %slot.spec.name, run_id, "task aborted");
                slot.status = TaskStatus::Aborted;
            }
        }
        self.core.route_outputs(uid, &output.events);
    }

    fn emit_done(&mut self) {
        let stats = self.stats.take();
        let now = self.store.counters();
        let fs = now.since(&self.fs_mark);
        self.fs_mark = now;

        let errored_tasks = self.core.tasks_with_status(TaskStatus::Error);
        let aborted_tasks = self.core.tasks_with_status(TaskStatus::Aborted);
        let success = errored_tasks.is_empty() && aborted_tasks.is_empty();
        if success {
            info!(
                jobs = stats.jobs,
                updated = stats.files_updated,
                deleted = stats.files_deleted,
                warnings = stats.warnings,
                "build finished"
            );
        } else {
            warn!(
                errored = ?errored_tasks,
                aborted = ?aborted_tasks,
                errors = stats.errors,
                "build finished with errors"
            );
        }

        let summary = RunSummary {
            success,
            errored_tasks,
            aborted_tasks,
            stats,
            fs,
        };
        self.running = false;
        self.state_tx.send_modify(|s| {
            s.running = false;
            s.runs += 1;
            s.summary = Some(summary);
        });
    }

    async fn clean(&mut self, tasks: &[String], force: bool) -> Result<CleanReport> {
        if let Some(name) = self.core.first_in_flight() {
            return Err(BuildError::TaskNotTerminal(name.to_string()));
        }
        let mut uids = Vec::with_capacity(tasks.len());
        for name in tasks {
            uids.push(
                self.core
                    .graph
                    .uid_of(name)
                    .ok_or_else(|| BuildError::UnknownTask(name.clone()))?,
            );
        }

        for uid in uids {
            let ctx = self.context(uid);
            ctx.state.load().await?;
            for job in ctx.state.job_names() {
                retire_job(&ctx, &job).await?;
            }
            let slot = &mut self.core.slots[uid];
            slot.jobs = None;
            slot.events.clear();
            info!(task = %slot.spec.name, "cleaned task outputs and state");
        }
        self.clean_targets(force).await
    }

    /// Files under a target directory that no task's state records.
    async fn clean_targets(&mut self, force: bool) -> Result<CleanReport> {
        let mut owned: HashSet<String> = HashSet::new();
        for slot in &self.core.slots {
            slot.state.load().await?;
            for state in slot.state.job_states().into_values() {
                owned.extend(state.outputs.into_keys());
            }
        }

        let everything = PatternSet::new(["**"])?;
        let mut report = CleanReport::default();
        for target in self.config.targets.keys() {
            let found = self
                .store
                .scan(target, &everything)
                .await
                .map_err(|e| BuildError::Other(e.into()))?;
            let stray: Vec<FileKey> = found
                .into_iter()
                .filter(|key| !owned.contains(&key.to_string()))
                .collect();
            if stray.is_empty() {
                continue;
            }
            if force {
                for key in &stray {
                    info!(key = %key, "deleting unexpected target file");
                    self.store
                        .prune(key, None)
                        .await
                        .map_err(|e| BuildError::Other(e.into()))?;
                }
                report.stray_removed = true;
            } else {
                warn!(
                    bucket = %target,
                    files = ?stray.iter().map(FileKey::relative).collect::<Vec<_>>(),
                    "unexpected files found in output target; clean with force to remove"
                );
            }
            report.stray.extend(stray);
        }
        Ok(report)
    }
}
