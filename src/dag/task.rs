// src/dag/task.rs

//! Task definitions as registered by the caller, and the resolved form the
//! engine runs.

use std::fmt;
use std::sync::Arc;

use crate::files::{FileKey, PatternSet};
use crate::job::TaskFn;
use crate::job::handle::BucketPolicy;
use crate::types::{ExecMode, TaskType};

/// A task as described by the caller.
///
/// ```no_run
/// use watchbuild::dag::TaskDef;
/// use watchbuild::job::sync_task_fn;
///
/// let copy = TaskDef::single("copy", sync_task_fn(|job| {
///     let file = job.file()?;
///     job.out(file.relative(), file.contents())?;
///     Ok(())
/// }))
/// .input("txt/*.txt")
/// .target("dev");
/// ```
#[derive(Clone)]
pub struct TaskDef {
    pub(crate) name: String,
    pub(crate) task_type: TaskType,
    pub(crate) inputs: Vec<String>,
    pub(crate) deps: Vec<String>,
    pub(crate) target: Option<String>,
    pub(crate) version: Option<String>,
    pub(crate) exec: ExecMode,
    pub(crate) func: Option<TaskFn>,
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("inputs", &self.inputs)
            .field("deps", &self.deps)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("exec", &self.exec)
            .field("func", &self.func.is_some())
            .finish()
    }
}

impl TaskDef {
    fn with(name: impl Into<String>, task_type: TaskType, func: Option<TaskFn>) -> Self {
        Self {
            name: name.into(),
            task_type,
            inputs: Vec::new(),
            deps: Vec::new(),
            target: None,
            version: None,
            exec: ExecMode::default(),
            func,
        }
    }

    /// One job per matched input file.
    pub fn single(name: impl Into<String>, func: TaskFn) -> Self {
        Self::with(name, TaskType::Single, Some(func))
    }

    /// One job over all matched input files.
    pub fn all(name: impl Into<String>, func: TaskFn) -> Self {
        Self::with(name, TaskType::All, Some(func))
    }

    /// A task with no function that only groups its dependencies.
    pub fn meta(name: impl Into<String>) -> Self {
        Self::with(name, TaskType::All, None)
    }

    /// Add an input glob, optionally prefixed with a producing task
    /// (`"copy:**/*.txt"`).
    pub fn input(mut self, pattern: impl Into<String>) -> Self {
        self.inputs.push(pattern.into());
        self
    }

    pub fn dep(mut self, task: impl Into<String>) -> Self {
        self.deps.push(task.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Fingerprint of the task's behaviour. Changing it re-runs every job.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn exec(mut self, exec: ExecMode) -> Self {
        self.exec = exec;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Split `"task:glob"` into its producer and pattern. A plain glob has no
/// producer.
pub(crate) fn split_input(input: &str) -> (Option<&str>, &str) {
    match input.split_once(':') {
        Some((producer, glob))
            if !producer.is_empty() && !producer.contains(['/', '*', '?', '[', '{']) =>
        {
            (Some(producer), glob)
        }
        _ => (None, input),
    }
}

/// Input patterns resolved to the bucket they are matched against.
#[derive(Debug, Clone)]
pub struct InputGlob {
    pub bucket: String,
    /// Task whose outputs this reads; `None` for the source tree.
    pub producer: Option<String>,
    pub patterns: PatternSet,
}

/// A validated, registered task.
#[derive(Clone)]
pub struct TaskSpec {
    pub name: String,
    /// Registration index.
    pub uid: usize,
    pub task_type: TaskType,
    pub inputs: Vec<InputGlob>,
    /// Direct dependencies, by descending phase then registration order.
    pub deps: Vec<String>,
    pub phase: usize,
    pub target: Option<String>,
    /// Bucket outputs are written to: the target, or the task's own name.
    pub output_bucket: String,
    pub version: Option<String>,
    pub exec: ExecMode,
    pub(crate) func: Option<TaskFn>,
    pub(crate) policy: Arc<BucketPolicy>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("task_type", &self.task_type)
            .field("deps", &self.deps)
            .field("phase", &self.phase)
            .field("output_bucket", &self.output_bucket)
            .field("exec", &self.exec)
            .finish_non_exhaustive()
    }
}

impl TaskSpec {
    /// Dependency-only task without jobs.
    pub fn is_meta(&self) -> bool {
        self.func.is_none()
    }

    /// Whether a key falls under one of the task's input globs.
    ///
    /// `owner` is the task that wrote the key. Inputs read from another task
    /// only match that task's outputs, even inside a shared target.
    pub fn matches(&self, key: &FileKey, owner: Option<&str>) -> bool {
        self.inputs.iter().any(|input| {
            input.bucket == key.bucket()
                && input.patterns.is_match(key.relative())
                && match &input.producer {
                    Some(producer) => owner == Some(producer.as_str()),
                    None => true,
                }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_prefix_is_a_producer_only_without_glob_chars() {
        assert_eq!(split_input("copy:**/*.txt"), (Some("copy"), "**/*.txt"));
        assert_eq!(split_input("txt/*.txt"), (None, "txt/*.txt"));
        assert_eq!(split_input("a/b:c"), (None, "a/b:c"));
        assert_eq!(split_input(":x"), (None, ":x"));
    }

    #[test]
    fn builder_collects_fields() {
        let def = TaskDef::meta("build").dep("copy").dep("concat").version("2");
        assert_eq!(def.name(), "build");
        assert_eq!(def.deps, vec!["copy", "concat"]);
        assert!(def.func.is_none());
        assert_eq!(def.version.as_deref(), Some("2"));
    }
}
