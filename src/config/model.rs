// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::LogLevel;

/// Name of the bucket that maps onto the source tree.
pub const SOURCE_BUCKET: &str = "source";

/// Configuration as read from a TOML file.
///
/// ```toml
/// source = "src"
/// statedir = ".gbstate"
///
/// [targets]
/// dev = "build/dev"
///
/// [limits]
/// tasks = 4
/// async_tasks = 4
/// jobs = 8
///
/// [io]
/// read_retries = 5
/// ```
///
/// Everything except `source` has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBuildConfig {
    /// Root of the `source` bucket.
    pub source: PathBuf,

    /// Where per-task state and intermediate outputs live.
    #[serde(default = "default_statedir")]
    pub statedir: PathBuf,

    /// Named output directories (`target name -> directory`).
    #[serde(default)]
    pub targets: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub limits: LimitsSection,

    #[serde(default)]
    pub io: IoSection,

    #[serde(default)]
    pub log_level: Option<LogLevel>,
}

/// `[limits]` section: the three concurrency quotas.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitsSection {
    /// Tasks doing their own work on the engine runtime.
    #[serde(default = "default_task_limit")]
    pub tasks: usize,

    /// Tasks marked `async` or `worker`.
    #[serde(default = "default_async_task_limit")]
    pub async_tasks: usize,

    /// Jobs executing at once across every running task.
    #[serde(default = "default_job_limit")]
    pub jobs: usize,
}

fn default_task_limit() -> usize {
    num_cpus::get().max(1)
}

fn default_async_task_limit() -> usize {
    4
}

fn default_job_limit() -> usize {
    4
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            tasks: default_task_limit(),
            async_tasks: default_async_task_limit(),
            jobs: default_job_limit(),
        }
    }
}

/// `[io]` section: read retry behaviour for files still being written by
/// another process.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IoSection {
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    /// Fixed delay after a "busy" error.
    #[serde(default = "default_busy_retry_ms")]
    pub busy_retry_ms: u64,

    /// Base delay for other errors; grows linearly with the attempt number.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_read_retries() -> u32 {
    5
}

fn default_busy_retry_ms() -> u64 {
    10
}

fn default_backoff_ms() -> u64 {
    25
}

impl Default for IoSection {
    fn default() -> Self {
        Self {
            read_retries: default_read_retries(),
            busy_retry_ms: default_busy_retry_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl IoSection {
    pub fn busy_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_ms)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

fn default_statedir() -> PathBuf {
    PathBuf::from(".gbstate")
}

/// Validated configuration handed to the engine.
///
/// Build one from TOML through [`crate::config::load_and_validate`] or in
/// code through [`BuildConfig::new`] and the `with_*` helpers followed by
/// [`BuildConfig::validated`].
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub source: PathBuf,
    pub statedir: PathBuf,
    pub targets: BTreeMap<String, PathBuf>,
    pub limits: LimitsSection,
    pub io: IoSection,
    pub log_level: Option<LogLevel>,
}

impl BuildConfig {
    pub fn new(source: impl Into<PathBuf>, statedir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            statedir: statedir.into(),
            targets: BTreeMap::new(),
            limits: LimitsSection::default(),
            io: IoSection::default(),
            log_level: None,
        }
    }

    pub fn with_target(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.targets.insert(name.into(), dir.into());
        self
    }

    pub fn with_limits(mut self, tasks: usize, async_tasks: usize, jobs: usize) -> Self {
        self.limits = LimitsSection {
            tasks,
            async_tasks,
            jobs,
        };
        self
    }

    pub fn with_io(mut self, io: IoSection) -> Self {
        self.io = io;
        self
    }

    pub(crate) fn new_unchecked(raw: RawBuildConfig) -> Self {
        Self {
            source: raw.source,
            statedir: raw.statedir,
            targets: raw.targets,
            limits: raw.limits,
            io: raw.io,
            log_level: raw.log_level,
        }
    }

    /// Directory holding `state.json` for a task.
    pub fn task_state_dir(&self, task: &str) -> PathBuf {
        self.statedir.join("tasks").join(task)
    }

    /// Private output bucket of a task without a target.
    pub fn task_out_dir(&self, task: &str) -> PathBuf {
        self.task_state_dir(task).join("out")
    }

    pub fn target_dir(&self, target: &str) -> Option<&Path> {
        self.targets.get(target).map(PathBuf::as_path)
    }
}
