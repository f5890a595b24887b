#![allow(dead_code)]

//! Ready-made task definitions used across the integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use watchbuild::{ExecMode, TaskDef, sync_task_fn};

/// Counts task function calls.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// SINGLE task copying each matched file to the same relative path.
pub fn copy_task(name: &str, input: &str, calls: &Calls) -> TaskDef {
    let calls = calls.clone();
    TaskDef::single(
        name,
        sync_task_fn(move |job| {
            calls.hit();
            let file = job.file()?;
            job.out(file.relative(), file.contents())?;
            Ok(())
        }),
    )
    .input(input)
}

/// ALL task concatenating every matched file, in key order, into `out`.
pub fn concat_task(name: &str, input: &str, out: &str, calls: &Calls) -> TaskDef {
    let calls = calls.clone();
    let out = out.to_string();
    TaskDef::all(
        name,
        sync_task_fn(move |job| {
            calls.hit();
            let mut files: Vec<_> = job.files().iter().collect();
            files.sort_by(|a, b| a.key().cmp(b.key()));
            let mut joined = Vec::new();
            for file in files {
                joined.extend_from_slice(file.contents());
            }
            job.out(out.clone(), joined)?;
            Ok(())
        }),
    )
    .input(input)
}

/// Same as [`copy_task`], run on a worker.
pub fn worker_copy_task(name: &str, input: &str, calls: &Calls) -> TaskDef {
    copy_task(name, input, calls).exec(ExecMode::Worker)
}
