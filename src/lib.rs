// src/lib.rs

//! `watchbuild`: an incremental build orchestrator.
//!
//! Register tasks on a [`BuildSystem`], [`start`](BuildSystem::start) it to
//! get an [`Engine`], then either run tasks once or keep them up to date
//! under a filesystem watcher.

pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod files;
pub mod fs;
pub mod job;
pub mod logging;
pub mod state;
pub mod types;
pub mod watch;
pub mod worker;

use std::sync::Arc;

use tracing::{debug, info};

pub use crate::config::BuildConfig;
pub use crate::dag::{TaskDef, TaskGraph};
pub use crate::engine::{CleanReport, Engine, EventDisposition, RunStats, RunSummary};
pub use crate::errors::{BuildError, FileError, JobError, Result};
pub use crate::files::{BuildFile, FileKey, FsEvent};
pub use crate::job::{JobHandle, TaskFn, sync_task_fn, task_fn};
pub use crate::types::{ExecMode, FsEventKind, LogLevel, TaskStatus, TaskType, Timestamp};

use crate::files::FileStore;
use crate::fs::{FileSystem, RealFileSystem};

/// Task registry plus the configuration an engine is started with.
#[derive(Debug)]
pub struct BuildSystem {
    config: Arc<BuildConfig>,
    fs: Arc<dyn FileSystem>,
    graph: TaskGraph,
}

impl BuildSystem {
    pub fn new(config: BuildConfig) -> Self {
        let graph = TaskGraph::new(config.targets.keys().cloned());
        Self {
            config: Arc::new(config),
            fs: Arc::new(RealFileSystem),
            graph,
        }
    }

    /// Use another filesystem backend (tests use [`fs::MockFileSystem`]).
    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Validate and add a task. Dependencies must already be registered.
    pub fn register_task(&mut self, def: TaskDef) -> Result<&mut Self> {
        let spec = self.graph.register(def)?;
        debug!(task = %spec.name, phase = spec.phase, deps = ?spec.deps, "registered task");
        Ok(self)
    }

    /// Freeze the task graph and spawn the engine on the current runtime.
    pub fn start(self) -> Engine {
        let mut store = FileStore::new(Arc::clone(&self.fs), &self.config);
        for spec in self.graph.tasks() {
            if spec.target.is_none() && !spec.is_meta() {
                store.add_bucket(spec.output_bucket.clone(), self.config.task_out_dir(&spec.name));
            }
        }
        info!(tasks = self.graph.len(), source = %self.config.source.display(), "starting build engine");
        Engine::start(self.config, Arc::new(self.graph), Arc::new(store))
    }
}
