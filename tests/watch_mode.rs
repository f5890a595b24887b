// tests/watch_mode.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use watchbuild::errors::BuildError;
use watchbuild::{EventDisposition, FileKey, FsEvent, TaskDef, TaskStatus, sync_task_fn, task_fn};
use watchbuild_test_utils::builders::{Calls, concat_task, copy_task};
use watchbuild_test_utils::workspace::TARGET;
use watchbuild_test_utils::{Workspace, init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn impacted(names: &[&str]) -> EventDisposition {
    EventDisposition::Impacted(names.iter().map(|n| n.to_string()).collect())
}

#[tokio::test]
async fn change_during_a_run_aborts_and_replays() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "one");

    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Notify::new());
    let calls = Calls::new();
    let slow = {
        let (gate, started, calls) = (gate.clone(), started.clone(), calls.clone());
        task_fn(move |job| {
            let (gate, started, calls) = (gate.clone(), started.clone(), calls.clone());
            async move {
                calls.hit();
                let file = job.file()?;
                started.notify_one();
                let _permit = gate.acquire().await?;
                job.out(file.relative(), file.contents())?;
                Ok(())
            }
        })
    };

    let mut system = ws.build_system();
    system.register_task(TaskDef::single("slow", slow).input("txt/*.txt").target(TARGET))?;
    let engine = system.start();

    engine.activate(&["slow"]).await?;
    with_timeout(started.notified()).await;
    assert_eq!(engine.task_status("slow").await?, Some(TaskStatus::Running));
    assert!(matches!(
        engine.activate(&["slow"]).await,
        Err(BuildError::TaskNotTerminal(_))
    ));

    ws.write("txt/a.txt", "two");
    let disposition = engine.fs_event(ws.source_event("txt/a.txt")).await?;
    assert_eq!(disposition, impacted(&["slow"]));

    gate.add_permits(10);
    let summary = with_timeout(engine.wait_done()).await?;
    assert!(summary.success, "{summary:?}");
    assert_eq!(summary.stats.jobs, 1);
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("two"));
    assert_eq!(calls.get(), 2);
    assert_eq!(engine.task_status("slow").await?, Some(TaskStatus::Done));
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn events_flow_through_to_dependent_tasks() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");
    ws.write("txt/b.txt", "b");

    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &Calls::new()))?;
    system.register_task(concat_task("bundle", "copy:txt/*.txt", "all.txt", &Calls::new()).target(TARGET))?;
    let engine = system.start();

    assert!(with_timeout(engine.run(&["bundle"])).await?.success);
    assert_eq!(ws.read_target("all.txt").as_deref(), Some("ab"));

    ws.write("txt/a.txt", "A");
    let disposition = engine.fs_event(ws.source_event("txt/a.txt")).await?;
    assert_eq!(disposition, impacted(&["copy", "bundle"]));
    let edited = with_timeout(engine.wait_done()).await?;
    assert_eq!(edited.stats.jobs, 2);
    assert_eq!(ws.read_target("all.txt").as_deref(), Some("Ab"));

    ws.write("txt/c.txt", "c");
    let added = FsEvent::add(FileKey::source("txt/c.txt"));
    engine.fs_event(added).await?;
    let grown = with_timeout(engine.wait_done()).await?;
    assert_eq!(grown.stats.jobs, 2);
    assert_eq!(ws.read_target("all.txt").as_deref(), Some("Abc"));

    ws.remove("txt/b.txt");
    engine.fs_event(ws.source_event("txt/b.txt")).await?;
    let shrunk = with_timeout(engine.wait_done()).await?;
    assert!(shrunk.success);
    assert_eq!(shrunk.stats.jobs, 1);
    assert_eq!(shrunk.stats.files_deleted, 1);
    assert_eq!(ws.read_task_out("copy", "txt/b.txt"), None);
    assert_eq!(ws.read_target("all.txt").as_deref(), Some("Ac"));
    assert_eq!(engine.runs_completed(), 4);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn irrelevant_events_do_not_start_a_run() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");

    let calls = Calls::new();
    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &calls).target(TARGET))?;
    let engine = system.start();
    with_timeout(engine.run(&["copy"])).await?;

    let same = engine.fs_event(ws.source_event("txt/a.txt")).await?;
    assert_eq!(same, EventDisposition::Ignored);

    ws.write("notes/readme.md", "hello");
    let unrelated = engine.fs_event(ws.source_event("notes/readme.md")).await?;
    assert_eq!(unrelated, EventDisposition::Deferred);
    assert!(!engine.is_running());
    assert_eq!(engine.runs_completed(), 1);
    assert_eq!(calls.get(), 1);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn user_data_survives_reruns_of_a_job() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");

    let mut system = ws.build_system();
    system.register_task(
        TaskDef::single(
            "count",
            sync_task_fn(|job| {
                let runs = job.with_user_data(|n: &mut u32| {
                    *n += 1;
                    *n
                });
                job.out(job.file()?.relative(), runs.to_string())?;
                Ok(())
            }),
        )
        .input("txt/*.txt")
        .target(TARGET),
    )?;
    let engine = system.start();

    with_timeout(engine.run(&["count"])).await?;
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("1"));

    ws.write("txt/a.txt", "a2");
    engine.fs_event(ws.source_event("txt/a.txt")).await?;
    with_timeout(engine.wait_done()).await?;
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("2"));
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn clean_removes_outputs_and_state() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");

    let calls = Calls::new();
    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &calls).target(TARGET))?;
    let engine = system.start();
    with_timeout(engine.run(&["copy"])).await?;
    assert!(ws.exists(&ws.state_file("copy")));

    let report = engine.clean(&["copy"], false).await?;
    assert!(report.stray.is_empty());
    assert_eq!(ws.read_target("txt/a.txt"), None);
    assert!(!ws.exists(&ws.state_file("copy")));

    let rebuilt = with_timeout(engine.run(&["copy"])).await?;
    assert_eq!(rebuilt.stats.jobs, 1);
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("a"));
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn clean_reports_unowned_target_files_and_removes_them_when_forced() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "a");
    ws.write("txt/b.txt", "b");

    let calls = Calls::new();
    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &calls).target(TARGET))?;
    system.register_task(concat_task("other", "txt/b.txt", "joined.txt", &calls).target(TARGET))?;
    let engine = system.start();
    with_timeout(engine.run(&["copy", "other"])).await?;
    ws.write_target("leftover/old.txt", "stale");

    // Outputs of the task that is not cleaned are still owned.
    let report = engine.clean(&["copy"], false).await?;
    assert_eq!(report.stray, vec![FileKey::new(TARGET, "leftover/old.txt")]);
    assert!(!report.stray_removed);
    assert_eq!(ws.read_target("leftover/old.txt").as_deref(), Some("stale"));
    assert_eq!(ws.read_target("txt/a.txt"), None);

    let forced = engine.clean(&["copy"], true).await?;
    assert_eq!(forced.stray, vec![FileKey::new(TARGET, "leftover/old.txt")]);
    assert!(forced.stray_removed);
    assert_eq!(ws.read_target("leftover/old.txt"), None);

    let again = engine.clean(&["copy"], false).await?;
    assert!(again.stray.is_empty());
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn watcher_picks_up_disk_edits() -> TestResult {
    init_tracing();
    let ws = Workspace::disk();
    ws.write("txt/a.txt", "one");

    let mut system = ws.build_system();
    system.register_task(copy_task("copy", "txt/*.txt", &Calls::new()).target(TARGET))?;
    let engine = system.start();
    assert!(with_timeout(engine.run(&["copy"])).await?.success);

    let _watch = engine.watch()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws.write("txt/a.txt", "two");

    with_timeout(async {
        while ws.read_target("txt/a.txt").as_deref() != Some("two") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    engine.stop();
    Ok(())
}
