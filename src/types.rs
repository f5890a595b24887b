// src/types.rs

//! Small shared value types.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// How a task turns its matched inputs into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// One job per matched input file.
    Single,
    /// One job named `"all"` over the whole input set.
    All,
}

/// Where a task's jobs execute.
///
/// `InProcess` and `Async` both run on the engine's runtime; they differ only
/// in which concurrency quota they count against. `Worker` tasks run on a
/// dedicated worker reached through the message protocol in [`crate::worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    #[default]
    InProcess,
    Async,
    Worker,
}

impl ExecMode {
    pub fn uses_async_quota(self) -> bool {
        !matches!(self, ExecMode::InProcess)
    }
}

/// Lifecycle state of a task inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    PreparingInputs,
    PreparingDeps,
    Running,
    Done,
    Error,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Aborted)
    }

    /// True while a spawned future owns the task's jobs.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskStatus::PreparingInputs | TaskStatus::PreparingDeps | TaskStatus::Running
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, TaskStatus::Error | TaskStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::PreparingInputs => "preparing_inputs",
            TaskStatus::PreparingDeps => "preparing_deps",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of filesystem change fed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Add,
    Change,
    Unlink,
}

/// Modification time in milliseconds since the Unix epoch.
///
/// [`Timestamp::DELETED`] marks a file that is known not to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const DELETED: Timestamp = Timestamp(-1);

    pub fn is_deleted(self) -> bool {
        self == Self::DELETED
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(_) => 0,
        };
        Timestamp(millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_deleted() {
            f.write_str("deleted")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Log verbosity, used by [`crate::logging`] and relayed worker log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("invalid log level: {other}")),
        }
    }
}
