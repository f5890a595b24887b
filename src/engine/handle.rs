// src/engine/handle.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::BuildConfig;
use crate::dag::TaskGraph;
use crate::errors::{BuildError, Result};
use crate::files::{FileStore, FsCountersSnapshot, FsEvent};
use crate::state::TaskState;
use crate::types::TaskStatus;
use crate::watch::WatchHandle;

use super::core::{Core, TaskSlot};
use super::runtime::Runtime;
use super::{CleanReport, EngineMsg, EngineState, RunSummary};

/// What the engine did with a filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// The event matches what the store already observed.
    Ignored,
    /// No active task cares; applied at the next idle point.
    Deferred,
    /// These active tasks re-run once in-flight work has stopped.
    Impacted(Vec<String>),
}

/// Handle on a running build engine.
///
/// Cheap to clone. The engine stops when [`Engine::stop`] is called or when
/// every handle is dropped.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::UnboundedSender<EngineMsg>,
    state_rx: watch::Receiver<EngineState>,
    store: Arc<FileStore>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Spawn the engine actor on the current tokio runtime.
    pub(crate) fn start(config: Arc<BuildConfig>, graph: Arc<TaskGraph>, store: Arc<FileStore>) -> Self {
        let fs = store.filesystem();
        let slots = graph
            .tasks()
            .map(|spec| {
                let state = TaskState::new(
                    spec.name.clone(),
                    &config.task_state_dir(&spec.name),
                    Arc::clone(&fs),
                );
                TaskSlot::new(Arc::clone(spec), Arc::new(state))
            })
            .collect();
        let core = Core::new(graph, slots, config.limits);

        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::default());
        let runtime = Runtime::new(core, config, Arc::clone(&store), rx, tx.downgrade(), state_tx);
        tokio::spawn(runtime.run());

        Self { tx, state_rx, store }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineMsg) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| BuildError::EngineStopped)?;
        rx.await.map_err(|_| BuildError::EngineStopped)
    }

    fn names<S: AsRef<str>>(tasks: &[S]) -> Vec<String> {
        tasks.iter().map(|t| t.as_ref().to_string()).collect()
    }

    /// Select the tasks to build (plus their dependencies) and start
    /// building. Fails while a previous run is still in flight.
    pub async fn activate<S: AsRef<str>>(&self, tasks: &[S]) -> Result<()> {
        let tasks = Self::names(tasks);
        self.request(|reply| EngineMsg::Activate { tasks, reply }).await?
    }

    /// Activate `tasks` and wait for the run to complete.
    pub async fn run<S: AsRef<str>>(&self, tasks: &[S]) -> Result<RunSummary> {
        self.activate(tasks).await?;
        self.wait_done().await
    }

    /// Wait until no run is in progress and return the latest summary.
    pub async fn wait_done(&self) -> Result<RunSummary> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| !s.running)
            .await
            .map_err(|_| BuildError::EngineStopped)?;
        Ok(state.summary.clone().unwrap_or_default())
    }

    /// Feed a filesystem change to the engine.
    pub async fn fs_event(&self, event: FsEvent) -> Result<EventDisposition> {
        self.request(|reply| EngineMsg::FsEvent {
            event,
            reply: Some(reply),
        })
        .await
    }

    /// Fire-and-forget variant used by the watcher thread.
    pub(crate) fn post_fs_event(&self, event: FsEvent) -> Result<()> {
        self.tx
            .send(EngineMsg::FsEvent { event, reply: None })
            .map_err(|_| BuildError::EngineStopped)
    }

    /// Watch the source and target directories and feed their changes to
    /// the engine until the returned handle is dropped.
    pub fn watch(&self) -> Result<WatchHandle> {
        crate::watch::watcher::start(self.clone(), Arc::clone(&self.store))
    }

    pub async fn task_status(&self, task: &str) -> Result<Option<TaskStatus>> {
        let task = task.to_string();
        self.request(|reply| EngineMsg::Status { task, reply }).await
    }

    /// Prune every recorded output of `tasks` and delete their job state,
    /// then look for target files no task owns. Those are reported, and
    /// deleted only with `force`.
    pub async fn clean<S: AsRef<str>>(&self, tasks: &[S], force: bool) -> Result<CleanReport> {
        let tasks = Self::names(tasks);
        self.request(|reply| EngineMsg::Clean { tasks, force, reply }).await?
    }

    /// Summary of the last completed run.
    pub fn stats(&self) -> Option<RunSummary> {
        self.state_rx.borrow().summary.clone()
    }

    /// Number of runs completed so far.
    pub fn runs_completed(&self) -> u64 {
        self.state_rx.borrow().runs
    }

    /// Physical filesystem operations since the engine started.
    pub fn fs_counters(&self) -> FsCountersSnapshot {
        self.store.counters()
    }

    pub fn is_running(&self) -> bool {
        self.state_rx.borrow().running
    }

    pub fn stop(&self) {
        if self.tx.send(EngineMsg::Stop).is_err() {
            debug!("engine already stopped");
        }
    }
}
