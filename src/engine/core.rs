// src/engine/core.rs

//! Scheduling state shared by the engine actor.
//!
//! Everything here is synchronous: which tasks are active, which may start,
//! which are impacted by a changed file. The actor in [`super::runtime`]
//! owns a [`Core`] and does all the spawning and I/O around it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::LimitsSection;
use crate::dag::{TaskGraph, TaskSpec};
use crate::errors::{BuildError, Result};
use crate::files::{FileKey, FsEvent};
use crate::job::Job;
use crate::state::TaskState;
use crate::types::{ExecMode, TaskStatus};

/// Per-task scheduling state.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    pub spec: Arc<TaskSpec>,
    pub status: TaskStatus,
    pub active: bool,
    /// Activation that last selected this task.
    pub generation: u64,
    /// `None` while a run owns the jobs, or before the first scan.
    pub jobs: Option<BTreeMap<String, Job>>,
    /// Events to fold into the jobs on the next run.
    pub events: Vec<FsEvent>,
    /// Impacted by a change during the current abort.
    pub flagged: bool,
    pub error: Option<String>,
    pub run_id: u64,
    pub state: Arc<TaskState>,
}

impl TaskSlot {
    pub fn new(spec: Arc<TaskSpec>, state: Arc<TaskState>) -> Self {
        Self {
            spec,
            status: TaskStatus::Pending,
            active: false,
            generation: 0,
            jobs: None,
            events: Vec::new(),
            flagged: false,
            error: None,
            run_id: 0,
            state,
        }
    }

    fn uses_async_quota(&self) -> bool {
        self.spec.exec.uses_async_quota()
    }
}

#[derive(Debug)]
pub(crate) struct Core {
    pub graph: Arc<TaskGraph>,
    pub slots: Vec<TaskSlot>,
    limits: LimitsSection,
    generation: u64,
}

impl Core {
    pub fn new(graph: Arc<TaskGraph>, slots: Vec<TaskSlot>, limits: LimitsSection) -> Self {
        Self {
            graph,
            slots,
            limits,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slot_by_name(&self, name: &str) -> Option<&TaskSlot> {
        self.graph.uid_of(name).map(|uid| &self.slots[uid])
    }

    pub fn any_in_flight(&self) -> bool {
        self.slots.iter().any(|s| s.status.is_in_flight())
    }

    pub fn first_in_flight(&self) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.status.is_in_flight())
            .map(|s| s.spec.name.as_str())
    }

    pub fn all_active_terminal(&self) -> bool {
        self.slots
            .iter()
            .filter(|s| s.active)
            .all(|s| s.status.is_terminal())
    }

    /// Select `names` and their dependencies as the active set.
    ///
    /// Refused while any task is in flight. Selected tasks restart from
    /// `pending` with a full input scan.
    pub fn activate<S: AsRef<str>>(&mut self, names: &[S]) -> Result<BTreeSet<usize>> {
        let selected = self.graph.with_dependencies(names)?;
        if let Some(name) = self.first_in_flight() {
            return Err(BuildError::TaskNotTerminal(name.to_string()));
        }

        self.generation += 1;
        for slot in &mut self.slots {
            if selected.contains(&slot.spec.uid) {
                slot.active = true;
                slot.generation = self.generation;
                slot.status = TaskStatus::Pending;
                slot.jobs = None;
                slot.events.clear();
                slot.flagged = false;
                slot.error = None;
            } else if slot.active {
                debug!(task = %slot.spec.name, "task deactivated");
                slot.active = false;
            }
        }
        info!(generation = self.generation, tasks = selected.len(), "activated tasks");
        Ok(selected)
    }

    /// Advance pending tasks that need no I/O and return the ones to start.
    ///
    /// A task whose dependency failed becomes `aborted`; a meta task whose
    /// dependencies are done is itself done. Nothing starts while
    /// `aborting`. Quotas count tasks already in flight.
    pub fn advance(&mut self, aborting: bool) -> Vec<usize> {
        let mut in_flight_sync = 0usize;
        let mut in_flight_async = 0usize;
        for slot in &self.slots {
            if slot.status.is_in_flight() {
                if slot.uses_async_quota() {
                    in_flight_async += 1;
                } else {
                    in_flight_sync += 1;
                }
            }
        }

        let mut start = Vec::new();
        // Registration order is a topological order.
        for uid in 0..self.slots.len() {
            let slot = &self.slots[uid];
            if !slot.active || slot.status != TaskStatus::Pending {
                continue;
            }

            let deps = self.graph.dep_uids(uid);
            let failed_dep = deps
                .iter()
                .find(|&&d| self.slots[d].status.is_failed())
                .map(|&d| self.slots[d].spec.name.clone());
            if let Some(dep) = failed_dep {
                let slot = &mut self.slots[uid];
                info!(task = %slot.spec.name, dep = %dep, "task aborted, dependency did not complete");
                slot.status = TaskStatus::Aborted;
                continue;
            }
            if !deps.iter().all(|&d| self.slots[d].status == TaskStatus::Done) {
                continue;
            }

            let slot = &mut self.slots[uid];
            if slot.spec.is_meta() {
                debug!(task = %slot.spec.name, "meta task done");
                slot.status = TaskStatus::Done;
                continue;
            }
            if aborting {
                continue;
            }

            let (used, quota) = if slot.uses_async_quota() {
                (&mut in_flight_async, self.limits.async_tasks)
            } else {
                (&mut in_flight_sync, self.limits.tasks)
            };
            if *used >= quota.max(1) {
                continue;
            }
            *used += 1;
            slot.status = TaskStatus::PreparingInputs;
            start.push(uid);
        }
        start
    }

    /// Active tasks a change to `key` affects: tasks whose input globs match
    /// it or whose jobs recorded it, plus everything depending on those.
    pub fn impacted(&self, key: &FileKey, owner: Option<&str>) -> BTreeSet<usize> {
        let key_str = key.to_string();
        let direct: Vec<usize> = self
            .slots
            .iter()
            .filter(|s| s.active)
            .filter(|s| s.spec.matches(key, owner) || s.state.references(&key_str))
            .map(|s| s.spec.uid)
            .collect();
        self.graph
            .dependors_of(direct)
            .into_iter()
            .filter(|&uid| self.slots[uid].active)
            .collect()
    }

    /// Queue an event on every active task that might care about it.
    pub fn route_event(&mut self, event: &FsEvent, owner: Option<&str>) {
        let key_str = event.key.to_string();
        for slot in &mut self.slots {
            if slot.active && (slot.spec.matches(&event.key, owner) || slot.state.references(&key_str)) {
                slot.events.push(event.clone());
            }
        }
    }

    /// Queue output events of `uid` on its active dependors.
    pub fn route_outputs(&mut self, uid: usize, events: &[FsEvent]) {
        if events.is_empty() {
            return;
        }
        let dependors = self.graph.dependors_of([uid]);
        for d in dependors {
            if d == uid || !self.slots[d].active {
                continue;
            }
            self.slots[d].events.extend(events.iter().cloned());
        }
    }

    /// After an abort settles: impacted and aborted tasks go back to pending.
    pub fn reset_after_abort(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for slot in &mut self.slots {
            if slot.active && (slot.flagged || slot.status == TaskStatus::Aborted) {
                slot.status = TaskStatus::Pending;
                slot.error = None;
                reset.push(slot.spec.name.clone());
            }
            slot.flagged = false;
        }
        reset
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.active && s.status == status)
            .map(|s| s.spec.name.clone())
            .collect()
    }

    pub fn exec_of(&self, uid: usize) -> ExecMode {
        self.slots[uid].spec.exec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TaskDef;
    use crate::fs::MockFileSystem;
    use crate::job::sync_task_fn;

    fn core() -> Core {
        let mut graph = TaskGraph::new(["dev"]);
        let noop = || sync_task_fn(|_job| Ok(()));
        graph.register(TaskDef::single("copy", noop()).input("txt/*.txt")).unwrap();
        graph.register(TaskDef::all("concat", noop()).input("copy:*.txt").target("dev")).unwrap();
        graph.register(TaskDef::single("other", noop()).input("other/*")).unwrap();
        graph.register(TaskDef::meta("build").dep("concat").dep("other")).unwrap();
        let graph = Arc::new(graph);
        let fs: Arc<dyn crate::fs::FileSystem> = Arc::new(MockFileSystem::new());
        let slots = graph
            .tasks()
            .map(|spec| {
                let dir = std::path::PathBuf::from(format!("/state/tasks/{}", spec.name));
                TaskSlot::new(
                    Arc::clone(spec),
                    Arc::new(TaskState::new(spec.name.clone(), &dir, Arc::clone(&fs))),
                )
            })
            .collect();
        let limits = LimitsSection {
            tasks: 1,
            async_tasks: 1,
            jobs: 1,
        };
        Core::new(graph, slots, limits)
    }

    #[test]
    fn activation_closes_over_dependencies() {
        let mut core = core();
        let selected = core.activate(&["concat"]).unwrap();
        assert_eq!(selected.len(), 2);
        assert!(!core.slot_by_name("other").unwrap().active);
        assert_eq!(core.generation(), 1);
    }

    #[test]
    fn advance_respects_deps_and_quota() {
        let mut core = core();
        core.activate(&["build"]).unwrap();

        // quota of one in-process task
        assert_eq!(core.advance(false), vec![0]);
        assert!(core.advance(false).is_empty());

        core.slots[0].status = TaskStatus::Done;
        assert_eq!(core.advance(false), vec![1]);

        core.slots[1].status = TaskStatus::Error;
        assert_eq!(core.advance(false), vec![2]);
        core.slots[2].status = TaskStatus::Done;
        core.advance(false);
        assert_eq!(core.slots[3].status, TaskStatus::Aborted);
        assert!(core.all_active_terminal());
    }

    #[test]
    fn activation_refused_while_in_flight() {
        let mut core = core();
        core.activate(&["copy"]).unwrap();
        core.advance(false);
        assert!(matches!(
            core.activate(&["copy"]),
            Err(BuildError::TaskNotTerminal(_))
        ));
    }

    #[test]
    fn nothing_starts_while_aborting() {
        let mut core = core();
        core.activate(&["copy"]).unwrap();
        assert!(core.advance(true).is_empty());
        assert_eq!(core.slots[0].status, TaskStatus::Pending);
    }

    #[test]
    fn impact_follows_globs_and_dependors() {
        let mut core = core();
        core.activate(&["build"]).unwrap();
        let impacted = core.impacted(&FileKey::source("txt/a.txt"), None);
        assert_eq!(impacted, [0, 1, 3].into_iter().collect());
        assert!(core.impacted(&FileKey::source("nothing.md"), None).is_empty());
    }
}
