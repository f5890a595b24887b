// tests/errors.rs

use watchbuild::errors::BuildError;
use watchbuild::{TaskDef, sync_task_fn, task_fn};
use watchbuild_test_utils::builders::{Calls, copy_task};
use watchbuild_test_utils::workspace::TARGET;
use watchbuild_test_utils::{Workspace, init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn two_jobs_writing_one_output_conflict() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");
    ws.write("txt/b.txt", "b");

    let mut system = ws.build_system();
    system.register_task(
        TaskDef::single(
            "squash",
            sync_task_fn(|job| {
                job.out("same.txt", job.file()?.contents())?;
                Ok(())
            }),
        )
        .input("txt/*.txt")
        .target(TARGET),
    )?;
    let engine = system.start();

    let summary = with_timeout(engine.run(&["squash"])).await?;
    assert!(!summary.success);
    assert_eq!(summary.errored_tasks, vec!["squash".to_string()]);
    assert_eq!(summary.stats.errors, 1);
    assert_eq!(summary.stats.files_updated, 1);
    assert!(ws.read_target("same.txt").is_some());
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn busy_reads_are_retried() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "alpha");
    ws.mock_fs().set_busy(ws.source_dir().join("txt/a.txt"), 2);

    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &Calls::new()).target(TARGET))?;
    let engine = system.start();

    let summary = with_timeout(engine.run(&["copy"])).await?;
    assert!(summary.success);
    assert_eq!(summary.fs.reads, 3);
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("alpha"));
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn reads_give_up_after_the_retry_budget() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "alpha");
    ws.mock_fs().set_busy(ws.source_dir().join("txt/a.txt"), 100);

    let calls = Calls::new();
    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &calls).target(TARGET))?;
    let engine = system.start();

    let summary = with_timeout(engine.run(&["copy"])).await?;
    assert!(!summary.success);
    assert_eq!(ws.read_target("txt/a.txt"), None);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn undeclared_bucket_reference_is_a_job_error() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");

    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &Calls::new()))?;
    system.register_task(
        TaskDef::all(
            "sneaky",
            task_fn(|job| async move {
                // "copy" is not a dependency of this task
                job.dep_add("copy:txt/a.txt").await?;
                Ok(())
            }),
        )
        .input("txt/*.txt"),
    )?;
    let engine = system.start();

    let summary = with_timeout(engine.run(&["copy", "sneaky"])).await?;
    assert!(!summary.success);
    assert_eq!(summary.errored_tasks, vec!["sneaky".to_string()]);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn failed_dependency_aborts_dependents() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");

    let downstream = Calls::new();
    let mut system = ws.build_system();
    system.register_task(
        TaskDef::single("broken", sync_task_fn(|_job| anyhow::bail!("nope"))).input("txt/*.txt"),
    )?;
    system.register_task(copy_task("after", "broken:**/*", &downstream).target(TARGET))?;
    let engine = system.start();

    let summary = with_timeout(engine.run(&["after"])).await?;
    assert!(!summary.success);
    assert_eq!(summary.errored_tasks, vec!["broken".to_string()]);
    assert_eq!(summary.aborted_tasks, vec!["after".to_string()]);
    assert_eq!(downstream.get(), 0);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn unknown_task_cannot_be_activated() {
    init_tracing();
    let ws = Workspace::mock();
    let mut system = ws.build_system();
    system
        .register_task(copy_task("copy", "txt/*.txt", &Calls::new()))
        .unwrap();
    let engine = system.start();

    let err = engine.run(&["nope"]).await.unwrap_err();
    assert!(matches!(err, BuildError::UnknownTask(name) if name == "nope"));
    engine.stop();
}

#[test]
fn invalid_definitions_are_rejected() {
    let ws = Workspace::mock();
    let mut system = ws.build_system();
    let noop = || sync_task_fn(|_job| Ok(()));
    system.register_task(TaskDef::single("copy", noop()).input("*.txt")).unwrap();

    let rejected = [
        TaskDef::single("copy", noop()).input("*.md"),
        TaskDef::single("source", noop()).input("*.md"),
        TaskDef::single(TARGET, noop()).input("*.md"),
        TaskDef::single("a/b", noop()).input("*.md"),
        TaskDef::single("a:b", noop()).input("*.md"),
        TaskDef::single("nofiles", noop()),
        TaskDef::single("lost", noop()).input("ghost:*.md"),
        TaskDef::single("orphan", noop()).input("*.md").dep("ghost"),
        TaskDef::single("nowhere", noop()).input("*.md").target("prod"),
        TaskDef::meta("empty"),
    ];
    for def in rejected {
        let name = def.name().to_string();
        let result = system.register_task(def);
        assert!(
            matches!(result, Err(BuildError::Config(_))),
            "{name} should be rejected"
        );
    }
    assert_eq!(system.graph().len(), 1);
}
