// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};

use crate::config::{SOURCE_BUCKET, is_valid_bucket_name};
use crate::errors::{BuildError, Result};
use crate::files::PatternSet;
use crate::job::handle::BucketPolicy;

use super::task::{InputGlob, TaskDef, TaskSpec, split_input};

/// Registered tasks and the dependency edges between them.
///
/// Nodes are registration indices; an edge `a -> b` means `b` depends on `a`.
/// A task may only depend on tasks registered before it, so the graph is
/// acyclic by construction.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    targets: BTreeSet<String>,
    tasks: Vec<Arc<TaskSpec>>,
    by_name: HashMap<String, usize>,
    graph: DiGraphMap<usize, ()>,
}

fn config_err(msg: String) -> BuildError {
    BuildError::Config(msg)
}

impl TaskGraph {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskSpec>> {
        self.tasks.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskSpec>> {
        self.by_name.get(name).map(|&uid| &self.tasks[uid])
    }

    pub fn uid_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn spec(&self, uid: usize) -> &Arc<TaskSpec> {
        &self.tasks[uid]
    }

    /// Validate and add a task.
    pub fn register(&mut self, def: TaskDef) -> Result<Arc<TaskSpec>> {
        self.validate(&def)?;

        let uid = self.tasks.len();
        let mut dep_uids: BTreeSet<usize> = BTreeSet::new();
        for dep in &def.deps {
            let d = self.uid_of(dep).ok_or_else(|| {
                config_err(format!("task \"{}\" depends on unknown task \"{dep}\"", def.name))
            })?;
            dep_uids.insert(d);
        }

        // (bucket, producer) -> patterns
        let mut grouped: BTreeMap<(String, Option<String>), Vec<String>> = BTreeMap::new();
        for input in &def.inputs {
            let (producer, glob) = split_input(input);
            match producer {
                None | Some(SOURCE_BUCKET) => {
                    grouped
                        .entry((SOURCE_BUCKET.to_string(), None))
                        .or_default()
                        .push(glob.to_string());
                }
                Some(producer) => {
                    let puid = self.uid_of(producer).ok_or_else(|| {
                        config_err(format!(
                            "task \"{}\" reads from unknown task \"{producer}\"",
                            def.name
                        ))
                    })?;
                    dep_uids.insert(puid);
                    for leaf in self.leaves(puid) {
                        let spec = &self.tasks[leaf];
                        grouped
                            .entry((spec.output_bucket.clone(), Some(spec.name.clone())))
                            .or_default()
                            .push(glob.to_string());
                    }
                }
            }
        }

        let mut inputs = Vec::with_capacity(grouped.len());
        for ((bucket, producer), patterns) in grouped {
            inputs.push(InputGlob {
                bucket,
                producer,
                patterns: PatternSet::new(&patterns)?,
            });
        }

        let mut deps: Vec<usize> = dep_uids.into_iter().collect();
        deps.sort_by(|a, b| {
            self.tasks[*b]
                .phase
                .cmp(&self.tasks[*a].phase)
                .then(a.cmp(b))
        });
        let phase = deps
            .iter()
            .map(|&d| self.tasks[d].phase + 1)
            .max()
            .unwrap_or(0);

        let mut policy = BucketPolicy {
            targets: self.targets.clone(),
            ..BucketPolicy::default()
        };
        for d in self.dependencies_of(deps.iter().copied()) {
            let spec = &self.tasks[d];
            policy
                .dep_buckets
                .insert(spec.name.clone(), spec.output_bucket.clone());
        }

        let spec = Arc::new(TaskSpec {
            output_bucket: def.target.clone().unwrap_or_else(|| def.name.clone()),
            name: def.name,
            uid,
            task_type: def.task_type,
            inputs,
            deps: deps.iter().map(|&d| self.tasks[d].name.clone()).collect(),
            phase,
            target: def.target,
            version: def.version,
            exec: def.exec,
            func: def.func,
            policy: Arc::new(policy),
        });

        self.graph.add_node(uid);
        for &d in &deps {
            self.graph.add_edge(d, uid, ());
        }
        self.by_name.insert(spec.name.clone(), uid);
        self.tasks.push(Arc::clone(&spec));
        Ok(spec)
    }

    fn validate(&self, def: &TaskDef) -> Result<()> {
        let name = &def.name;
        if !is_valid_bucket_name(name) {
            return Err(config_err(format!("task name \"{name}\" is empty or contains an invalid character")));
        }
        if name == SOURCE_BUCKET || self.targets.contains(name) {
            return Err(config_err(format!("task name \"{name}\" is reserved for a bucket")));
        }
        if self.by_name.contains_key(name) {
            return Err(config_err(format!("task \"{name}\" is already registered")));
        }

        if def.inputs.is_empty() {
            if def.func.is_some() {
                return Err(config_err(format!("task \"{name}\" has a function but no input")));
            }
            if def.target.is_some() {
                return Err(config_err(format!("task \"{name}\" has no input and cannot have a target")));
            }
            if def.deps.is_empty() {
                return Err(config_err(format!("task \"{name}\" has neither input nor dependencies")));
            }
        } else if def.func.is_none() {
            return Err(config_err(format!("task \"{name}\" has input but no function")));
        }

        if let Some(target) = &def.target {
            if !self.targets.contains(target) {
                return Err(config_err(format!("task \"{name}\" writes to unknown target \"{target}\"")));
            }
        }
        Ok(())
    }

    /// Non-meta tasks a task stands for: itself, or for a meta task the
    /// leaves of its dependencies.
    pub(crate) fn leaves(&self, uid: usize) -> Vec<usize> {
        if !self.tasks[uid].is_meta() {
            return vec![uid];
        }
        let mut out: Vec<usize> = self
            .dep_uids(uid)
            .into_iter()
            .flat_map(|d| self.leaves(d))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Direct dependencies of a task.
    pub(crate) fn dep_uids(&self, uid: usize) -> Vec<usize> {
        self.graph
            .neighbors_directed(uid, Direction::Incoming)
            .collect()
    }

    /// Direct dependors of a task.
    pub fn dependors(&self, name: &str) -> Vec<String> {
        let Some(uid) = self.uid_of(name) else {
            return Vec::new();
        };
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(uid, Direction::Outgoing)
            .collect();
        out.sort_unstable();
        out.into_iter().map(|d| self.tasks[d].name.clone()).collect()
    }

    /// The given tasks and everything they depend on.
    pub(crate) fn dependencies_of(&self, starts: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::empty(reversed);
        let mut out = BTreeSet::new();
        for start in starts {
            dfs.move_to(start);
            while let Some(n) = dfs.next(reversed) {
                out.insert(n);
            }
        }
        out
    }

    /// The given tasks and everything that depends on them.
    pub(crate) fn dependors_of(&self, starts: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        let mut dfs = Dfs::empty(&self.graph);
        let mut out = BTreeSet::new();
        for start in starts {
            dfs.move_to(start);
            while let Some(n) = dfs.next(&self.graph) {
                out.insert(n);
            }
        }
        out
    }

    /// Resolve names and close over their dependencies.
    pub fn with_dependencies<S: AsRef<str>>(&self, names: &[S]) -> Result<BTreeSet<usize>> {
        let mut starts = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            starts.push(
                self.uid_of(name)
                    .ok_or_else(|| BuildError::UnknownTask(name.to_string()))?,
            );
        }
        Ok(self.dependencies_of(starts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::sync_task_fn;
    use crate::types::TaskType;

    fn noop() -> crate::job::TaskFn {
        sync_task_fn(|_job| Ok(()))
    }

    fn graph() -> TaskGraph {
        let mut g = TaskGraph::new(["dev"]);
        g.register(TaskDef::single("copy", noop()).input("txt/*.txt")).unwrap();
        g.register(TaskDef::single("img", noop()).input("img/*.png")).unwrap();
        g.register(TaskDef::meta("assets").dep("copy").dep("img")).unwrap();
        g.register(
            TaskDef::all("concat", noop())
                .input("assets:**/*")
                .target("dev"),
        )
        .unwrap();
        g
    }

    #[test]
    fn meta_inputs_unwrap_to_leaf_buckets() {
        let g = graph();
        let concat = g.get("concat").unwrap();
        assert_eq!(concat.task_type, TaskType::All);
        let buckets: Vec<&str> = concat.inputs.iter().map(|i| i.bucket.as_str()).collect();
        assert_eq!(buckets, vec!["copy", "img"]);
        assert_eq!(concat.deps, vec!["assets"]);
        assert_eq!(concat.phase, 2);
        assert_eq!(concat.output_bucket, "dev");
        assert!(concat.policy.resolve(crate::files::FileKey::parse("copy:a.txt")).is_some());
    }

    #[test]
    fn leaves_sharing_a_target_keep_separate_producers() {
        let mut g = TaskGraph::new(["dev"]);
        g.register(TaskDef::single("s1", noop()).input("*.s1").target("dev")).unwrap();
        g.register(TaskDef::single("s2", noop()).input("*.s2").target("dev")).unwrap();
        g.register(TaskDef::meta("both").dep("s1").dep("s2")).unwrap();
        let reader = g
            .register(TaskDef::all("reader", noop()).input("both:**"))
            .unwrap();

        let producers: Vec<(&str, Option<&str>)> = reader
            .inputs
            .iter()
            .map(|i| (i.bucket.as_str(), i.producer.as_deref()))
            .collect();
        assert_eq!(producers, vec![("dev", Some("s1")), ("dev", Some("s2"))]);

        let key = crate::files::FileKey::new("dev", "a.s1");
        assert!(reader.matches(&key, Some("s1")));
        assert!(!reader.matches(&key, Some("reader")));
        assert!(!reader.matches(&key, None));
    }

    #[test]
    fn closures_follow_edges() {
        let g = graph();
        let deps = g.with_dependencies(&["concat"]).unwrap();
        assert_eq!(deps.len(), 4);
        let copy = g.uid_of("copy").unwrap();
        let dependors = g.dependors_of([copy]);
        let names: BTreeSet<&str> = dependors.iter().map(|&u| g.spec(u).name.as_str()).collect();
        assert_eq!(names, ["assets", "concat", "copy"].into_iter().collect());
        assert_eq!(g.dependors("assets"), vec!["concat"]);
    }

    #[test]
    fn unknown_task_in_activation() {
        let g = graph();
        assert!(matches!(
            g.with_dependencies(&["nope"]),
            Err(BuildError::UnknownTask(_))
        ));
    }

    #[test]
    fn registration_rejects_bad_definitions() {
        let mut g = graph();
        let cases = vec![
            TaskDef::single("source", noop()).input("x"),
            TaskDef::single("dev", noop()).input("x"),
            TaskDef::single("copy", noop()).input("x"),
            TaskDef::single("a:b", noop()).input("x"),
            TaskDef::single("nofiles", noop()),
            TaskDef::meta("nodeps"),
            TaskDef::meta("tgt").dep("copy").target("dev"),
            TaskDef::single("badtarget", noop()).input("x").target("prod"),
            TaskDef::single("badproducer", noop()).input("missing:*.txt"),
            TaskDef::single("baddep", noop()).input("x").dep("missing"),
        ];
        for def in cases {
            let name = def.name().to_string();
            assert!(
                matches!(g.register(def), Err(BuildError::Config(_))),
                "{name} should be rejected"
            );
        }
        assert_eq!(g.len(), 4);
    }

    #[test]
    fn deps_sorted_by_phase_then_registration() {
        let mut g = graph();
        let spec = g
            .register(TaskDef::all("zip", noop()).input("copy:*.txt").dep("concat").dep("img"))
            .unwrap();
        assert_eq!(spec.deps, vec!["concat", "copy", "img"]);
        assert_eq!(spec.phase, 3);
    }
}
