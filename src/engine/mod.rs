// src/engine/mod.rs

//! The build engine.
//!
//! A single actor task owns every task's scheduling state. Everything that
//! suspends (disk I/O, task functions, worker messaging) runs in spawned
//! futures that report back over the actor's channel. The pieces:
//!
//! - [`core`]: synchronous scheduling decisions (activation, quotas,
//!   impact of a changed file).
//! - [`runtime`]: the actor loop, the abort/resume protocol and run
//!   completion.
//! - [`task_run`]: one run of one task.
//! - [`handle`]: the cloneable [`Engine`] handle the caller drives.

use tokio::sync::oneshot;

use crate::errors::Result;
use crate::files::FsEvent;
use crate::types::TaskStatus;

pub mod abort;
pub(crate) mod core;
pub mod handle;
pub(crate) mod runtime;
pub mod stats;
pub(crate) mod task_run;

pub use abort::AbortToken;
pub use handle::{Engine, EventDisposition};
pub use stats::{CleanReport, RunStats, RunSummary, StatsCounters};

/// Messages into the engine actor.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    Activate {
        tasks: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    FsEvent {
        event: FsEvent,
        reply: Option<oneshot::Sender<EventDisposition>>,
    },
    TaskProgress {
        uid: usize,
        run_id: u64,
        status: TaskStatus,
    },
    TaskFinished {
        uid: usize,
        run_id: u64,
        output: task_run::TaskRunOutput,
    },
    Status {
        task: String,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    Clean {
        tasks: Vec<String>,
        force: bool,
        reply: oneshot::Sender<Result<CleanReport>>,
    },
    Stop,
}

/// What the actor publishes to engine handles.
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineState {
    /// An activation or a change-triggered re-run has not completed yet.
    pub running: bool,
    /// Number of completed runs.
    pub runs: u64,
    pub summary: Option<RunSummary>,
}
