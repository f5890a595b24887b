// src/errors.rs

//! Crate-wide error types.
//!
//! - [`BuildError`] is what the public API returns (registration, activation,
//!   config loading, watcher setup).
//! - [`FileError`] is the per-file error kept by the file store. It is cheap to
//!   clone because a cached failure is handed to every requester of the path.
//! - [`JobError`] is what task functions see from the job handle.

use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Task \"{0}\" is still in flight; wait for the current run to finish")]
    TaskNotTerminal(String),

    #[error("Build engine has stopped")]
    EngineStopped,

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob: {0}")]
    Glob(#[from] globset::Error),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Error attached to a single `bucket:relative` file.
#[derive(Error, Debug, Clone)]
pub enum FileError {
    #[error("file \"{0}\" does not exist")]
    Missing(String),

    #[error("{key}: {source}")]
    Io {
        key: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("\"{key}\" is already output by \"{owner}\", cannot be written by \"{who}\"")]
    Conflict {
        key: String,
        owner: String,
        who: String,
    },

    #[error("unknown bucket \"{0}\"")]
    UnknownBucket(String),
}

impl FileError {
    pub(crate) fn io(key: impl ToString, err: io::Error) -> Self {
        FileError::Io {
            key: key.to_string(),
            source: Arc::new(err),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FileError::Missing(_))
    }
}

/// Errors surfaced to task functions through the job handle.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error(
        "job \"{job}\" references \"{key}\" but bucket \"{bucket}\" is neither source, a target, nor a dependency of the task"
    )]
    UndeclaredDependency {
        job: String,
        key: String,
        bucket: String,
    },

    #[error("output \"{0}\" was already staged by this job")]
    DuplicateOutput(String),

    #[error("job has no single input file")]
    NoSingleInput,

    #[error("worker channel closed")]
    Disconnected,

    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    File(#[from] FileError),
}
