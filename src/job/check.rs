// src/job/check.rs

//! The incremental-rebuild decision.

use std::collections::BTreeSet;
use std::fmt;

use crate::files::{FileKey, FileStore};
use crate::state::JobState;

use super::Job;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StaleReason {
    NoPreviousState,
    VersionChanged,
    PreviousProblems,
    NewInput(String),
    DepChanged(String),
    OutputChanged(String),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NoPreviousState => f.write_str("no previous state"),
            StaleReason::VersionChanged => f.write_str("task version changed"),
            StaleReason::PreviousProblems => f.write_str("previous run reported errors or warnings"),
            StaleReason::NewInput(key) => write!(f, "new input {key}"),
            StaleReason::DepChanged(key) => write!(f, "dependency {key} changed"),
            StaleReason::OutputChanged(key) => write!(f, "output {key} changed"),
        }
    }
}

/// Why a job must run, plus the outputs whose recorded hash can no longer be
/// trusted for write dedupe.
#[derive(Debug, Clone)]
pub(crate) struct Stale {
    pub reason: StaleReason,
    pub invalid_outputs: BTreeSet<String>,
}

/// Decide whether `job` can be skipped.
///
/// Equal timestamps count as unchanged; content is never read here.
pub(crate) async fn check_up_to_date(
    store: &FileStore,
    version: Option<&str>,
    job: &Job,
    last: Option<&JobState>,
) -> Result<(), Stale> {
    let Some(last) = last else {
        return Err(Stale {
            reason: StaleReason::NoPreviousState,
            invalid_outputs: BTreeSet::new(),
        });
    };

    // Outputs are checked first and in full: a stale job must know every
    // output whose timestamp moved so a byte-identical rewrite is not skipped.
    let mut invalid_outputs = BTreeSet::new();
    for (key, record) in &last.outputs {
        let current = store.stat(&FileKey::parse(key)).await;
        if current.ok() != Some(record.ts) {
            invalid_outputs.insert(key.clone());
        }
    }

    let reason = stale_reason(store, version, job, last, &invalid_outputs).await;
    match reason {
        None => Ok(()),
        Some(reason) => Err(Stale {
            reason,
            invalid_outputs,
        }),
    }
}

async fn stale_reason(
    store: &FileStore,
    version: Option<&str>,
    job: &Job,
    last: &JobState,
    invalid_outputs: &BTreeSet<String>,
) -> Option<StaleReason> {
    if last.version.as_deref() != version {
        return Some(StaleReason::VersionChanged);
    }
    if last.has_problems() {
        return Some(StaleReason::PreviousProblems);
    }
    for key in &job.base {
        let key = key.to_string();
        if !last.deps.contains_key(&key) {
            return Some(StaleReason::NewInput(key));
        }
    }
    for (key, ts) in &last.deps {
        let current = store.stat(&FileKey::parse(key)).await;
        if current.ok() != Some(*ts) {
            return Some(StaleReason::DepChanged(key.clone()));
        }
    }
    invalid_outputs
        .iter()
        .next()
        .map(|key| StaleReason::OutputChanged(key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::fs::MockFileSystem;
    use crate::state::OutputRecord;
    use crate::types::Timestamp;
    use std::sync::Arc;

    async fn setup() -> (MockFileSystem, FileStore, Job, JobState) {
        let fs = MockFileSystem::new();
        let in_ts = fs.add_file("/src/a.txt", "1");
        let out_ts = fs.add_file("/dev/a.txt", "1");
        let config = BuildConfig::new("/src", "/state").with_target("dev", "/dev");
        let store = FileStore::new(Arc::new(fs.clone()), &config);

        let key = FileKey::source("a.txt");
        let job = Job::new(key.to_string(), [key.clone()].into_iter().collect());
        let mut last = JobState::default();
        last.deps.insert(key.to_string(), in_ts);
        last.outputs.insert(
            "dev:a.txt".to_string(),
            OutputRecord {
                ts: out_ts,
                hash: crate::files::content_hash(b"1"),
            },
        );
        (fs, store, job, last)
    }

    #[tokio::test]
    async fn unchanged_job_is_up_to_date() {
        let (_fs, store, job, last) = setup().await;
        assert!(check_up_to_date(&store, None, &job, Some(&last)).await.is_ok());
    }

    #[tokio::test]
    async fn reasons_in_order() {
        let (fs, store, job, mut last) = setup().await;

        let stale = check_up_to_date(&store, None, &job, None).await.unwrap_err();
        assert_eq!(stale.reason, StaleReason::NoPreviousState);

        let stale = check_up_to_date(&store, Some("2"), &job, Some(&last)).await.unwrap_err();
        assert_eq!(stale.reason, StaleReason::VersionChanged);

        last.warnings.push("careful".to_string());
        let stale = check_up_to_date(&store, None, &job, Some(&last)).await.unwrap_err();
        assert_eq!(stale.reason, StaleReason::PreviousProblems);
        last.warnings.clear();

        fs.add_file("/dev/a.txt", "edited");
        let fresh = FileStore::new(
            Arc::new(fs.clone()),
            &BuildConfig::new("/src", "/state").with_target("dev", "/dev"),
        );
        let stale = check_up_to_date(&fresh, None, &job, Some(&last)).await.unwrap_err();
        assert_eq!(stale.reason, StaleReason::OutputChanged("dev:a.txt".to_string()));
        assert!(stale.invalid_outputs.contains("dev:a.txt"));
        drop(store);
    }

    #[tokio::test]
    async fn new_input_and_changed_dep() {
        let (_fs, store, mut job, mut last) = setup().await;
        job.base.insert(FileKey::source("b.txt"));
        let stale = check_up_to_date(&store, None, &job, Some(&last)).await.unwrap_err();
        assert_eq!(stale.reason, StaleReason::NewInput("source:b.txt".to_string()));

        job.base.remove(&FileKey::source("b.txt"));
        last.deps.insert("source:gone.json".to_string(), Timestamp(3));
        let stale = check_up_to_date(&store, None, &job, Some(&last)).await.unwrap_err();
        assert_eq!(stale.reason, StaleReason::DepChanged("source:gone.json".to_string()));
    }
}
