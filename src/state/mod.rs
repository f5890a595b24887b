// src/state/mod.rs

//! Persisted per-task job state.
//!
//! One JSON document per task at `<statedir>/tasks/<name>/state.json`, mapping
//! job name to a [`JobState`]. The map is loaded once per activation and saved
//! after every job completion. Saves for one task never interleave: a save
//! requested while another is writing waits, then writes the newest data (or
//! nothing, if a later waiter already did).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{BuildError, Result};
use crate::fs::{FileSystem, remove_file_with_rmdir, write_with_mkdir};
use crate::types::Timestamp;

pub const STATE_FILE_NAME: &str = "state.json";

/// A recorded output: its mtime after the write and a digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub ts: Timestamp,
    pub hash: String,
}

/// What one job read and wrote during its last run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    #[serde(default)]
    pub deps: BTreeMap<String, Timestamp>,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputRecord>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl JobState {
    pub fn references(&self, key: &str) -> bool {
        self.deps.contains_key(key) || self.outputs.contains_key(key)
    }

    pub fn has_problems(&self) -> bool {
        !self.errors.is_empty() || !self.warnings.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<String, JobState>,
    loaded: bool,
    generation: u64,
}

/// Handle on one task's `state.json`.
#[derive(Debug)]
pub struct TaskState {
    task: String,
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    inner: Mutex<Inner>,
    /// Generation of the data last written to disk.
    saved: tokio::sync::Mutex<u64>,
}

impl TaskState {
    pub fn new(task: impl Into<String>, dir: &Path, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            task: task.into(),
            path: dir.join(STATE_FILE_NAME),
            fs,
            inner: Mutex::new(Inner::default()),
            saved: tokio::sync::Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    /// Load from disk unless already loaded. A missing file is a blank state;
    /// an unparsable one is logged and replaced by a blank state.
    pub async fn load(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let fs = Arc::clone(&self.fs);
        let path = self.path.clone();
        let read = tokio::task::spawn_blocking(move || fs.read(&path))
            .await
            .map_err(|e| BuildError::Other(anyhow::anyhow!("state load task failed: {e}")))?;

        let jobs = match read {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, JobState>>(&bytes) {
                Ok(jobs) => {
                    debug!(task = %self.task, jobs = jobs.len(), "loaded existing job state");
                    jobs
                }
                Err(err) => {
                    warn!(
                        task = %self.task,
                        path = %self.path.display(),
                        "error parsing job state, resetting to blank state: {err}"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(BuildError::Io(err)),
        };

        let mut inner = self.lock();
        if !inner.loaded {
            inner.jobs = jobs;
            inner.loaded = true;
        }
        Ok(())
    }

    pub fn job_state(&self, job: &str) -> Option<JobState> {
        self.lock().jobs.get(job).cloned()
    }

    pub fn job_states(&self) -> BTreeMap<String, JobState> {
        self.lock().jobs.clone()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.lock().jobs.keys().cloned().collect()
    }

    /// Whether any recorded job read or wrote `key`.
    pub fn references(&self, key: &str) -> bool {
        self.lock().jobs.values().any(|js| js.references(key))
    }

    /// Names of jobs that recorded `key` as a dependency or output.
    pub fn jobs_referencing(&self, key: &str) -> Vec<String> {
        self.lock()
            .jobs
            .iter()
            .filter(|(_, js)| js.references(key))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Set (or with `None`, remove) a job's state and persist the task file.
    pub async fn set_job_state(&self, job: &str, state: Option<JobState>) -> Result<()> {
        {
            let mut inner = self.lock();
            match state {
                Some(state) => {
                    inner.jobs.insert(job.to_string(), state);
                }
                None => {
                    inner.jobs.remove(job);
                }
            }
            inner.generation += 1;
        }
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let mut saved = self.saved.lock().await;

        let (generation, data) = {
            let inner = self.lock();
            if inner.generation <= *saved {
                return Ok(());
            }
            let data = if inner.jobs.is_empty() {
                None
            } else {
                Some(serde_json::to_vec_pretty(&inner.jobs)?)
            };
            (inner.generation, data)
        };

        let fs = Arc::clone(&self.fs);
        let path = self.path.clone();
        let stop_at = self
            .path
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let task = self.task.clone();
        tokio::task::spawn_blocking(move || match data {
            Some(bytes) => {
                debug!(task = %task, path = %path.display(), "writing job state");
                write_with_mkdir(fs.as_ref(), &path, &bytes)
            }
            None => {
                debug!(task = %task, path = %path.display(), "pruning empty job state");
                remove_file_with_rmdir(fs.as_ref(), &path, &stop_at)
            }
        })
        .await
        .map_err(|e| BuildError::Other(anyhow::anyhow!("state save task failed: {e}")))??;

        *saved = generation;
        Ok(())
    }
}
