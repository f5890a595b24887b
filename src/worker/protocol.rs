// src/worker/protocol.rs

//! Messages exchanged between the engine and a worker.
//!
//! Every message is a JSON object tagged by `"type"`, so the same types work
//! over an in-process channel or a byte pipe to another process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{BuildError, Result};
use crate::files::{BuildFile, FileKey};
use crate::types::{LogLevel, TaskType, Timestamp};

/// A file inlined into a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFile {
    pub key: String,
    pub timestamp: Timestamp,
    pub contents: Vec<u8>,
}

impl WireFile {
    pub fn from_file(file: &BuildFile) -> Self {
        Self {
            key: file.key().to_string(),
            timestamp: file.timestamp(),
            contents: file.contents().to_vec(),
        }
    }

    pub fn into_file(self) -> BuildFile {
        BuildFile::new(FileKey::parse(&self.key), self.timestamp, Arc::from(self.contents))
    }
}

/// A job to execute. Files are indices into [`Message::TaskExecute::files`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireJob {
    pub name: String,
    pub files: Vec<usize>,
    pub updated: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
}

/// A staged output. `contents: None` means "unchanged since last run".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOutput {
    pub relative: String,
    pub contents: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Parent -> worker, once: what task this worker runs.
    TaskInit {
        task: String,
        task_type: TaskType,
        targets: BTreeSet<String>,
        dep_buckets: BTreeMap<String, String>,
    },
    /// Parent -> worker: run a batch of stale jobs.
    TaskExecute {
        files: Vec<WireFile>,
        jobs: Vec<WireJob>,
    },
    /// Worker -> parent: one job finished (or was skipped by an abort).
    JobDone {
        job: String,
        outputs: Vec<WireOutput>,
        warnings: Vec<String>,
        errors: Vec<String>,
        deps: BTreeMap<String, Timestamp>,
        dep_reset: bool,
        aborted: bool,
    },
    /// Worker -> parent: load a dependency. Answered by `Response`.
    JobDepAdd { id: u64, job: String, key: String },
    /// Worker -> parent: a job reset its dynamic dependencies.
    JobDepReset { job: String },
    /// Worker -> parent: the batch is finished.
    TaskComplete,
    /// Parent -> worker: answer to a request. `Ok(None)` means missing.
    Response {
        id: u64,
        result: std::result::Result<Option<WireFile>, String>,
    },
    /// Worker -> parent: a log line to relay.
    Log {
        level: LogLevel,
        job: String,
        message: String,
    },
    /// Parent -> worker: stop starting jobs in the current batch.
    Abort,
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(BuildError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_by_type() {
        let json = Message::JobDepReset { job: "all".to_string() }.encode().unwrap();
        assert_eq!(json, r#"{"type":"job_dep_reset","job":"all"}"#);
        assert_eq!(Message::TaskComplete.encode().unwrap(), r#"{"type":"task_complete"}"#);
    }

    #[test]
    fn response_carries_missing_as_null() {
        let msg = Message::Response { id: 3, result: Ok(None) };
        let back = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);

        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["result"], serde_json::json!({ "Ok": null }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Message::decode(r#"{"type":"reboot"}"#).is_err());
    }
}
