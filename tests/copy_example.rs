// tests/copy_example.rs

use watchbuild::{BuildSystem, Engine};
use watchbuild_test_utils::builders::{Calls, copy_task};
use watchbuild_test_utils::workspace::TARGET;
use watchbuild_test_utils::{Workspace, init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn start_copy(ws: &Workspace, calls: &Calls) -> Engine {
    let mut system: BuildSystem = ws.build_system();
    system
        .register_task(copy_task("copy", "txt/*.txt", calls).target(TARGET))
        .expect("register copy");
    system.start()
}

#[tokio::test]
async fn copy_runs_two_then_zero_then_one() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "alpha");
    ws.write("txt/b.txt", "beta");
    ws.write("img/skip.png", "png");

    let calls = Calls::new();
    let engine = start_copy(&ws, &calls);

    let first = with_timeout(engine.run(&["copy"])).await?;
    assert!(first.success);
    assert_eq!(first.stats.jobs, 2);
    assert_eq!(first.stats.files_updated, 2);
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("alpha"));
    assert_eq!(ws.read_target("txt/b.txt").as_deref(), Some("beta"));
    assert_eq!(ws.read_target("img/skip.png"), None);

    let second = with_timeout(engine.run(&["copy"])).await?;
    assert!(second.success);
    assert_eq!(second.stats.jobs, 0);
    assert_eq!(second.fs.reads, 0);
    assert_eq!(second.fs.writes, 0);

    ws.write("txt/a.txt", "alpha 2");
    let third = with_timeout(engine.run(&["copy"])).await?;
    assert!(third.success);
    assert_eq!(third.stats.jobs, 1);
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("alpha 2"));
    assert_eq!(calls.get(), 3);

    engine.stop();
    Ok(())
}

#[tokio::test]
async fn fresh_engine_reuses_persisted_state() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "alpha");
    ws.write("txt/b.txt", "beta");

    let calls = Calls::new();
    let engine = start_copy(&ws, &calls);
    assert_eq!(with_timeout(engine.run(&["copy"])).await?.stats.jobs, 2);
    engine.stop();
    assert!(ws.exists(&ws.state_file("copy")));

    let engine = start_copy(&ws, &calls);
    let summary = with_timeout(engine.run(&["copy"])).await?;
    assert!(summary.success);
    assert_eq!(summary.stats.jobs, 0);
    assert_eq!(calls.get(), 2);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn removed_input_prunes_its_output() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "alpha");
    ws.write("txt/nested/b.txt", "beta");

    let calls = Calls::new();
    let engine = start_copy(&ws, &calls);
    // `*` does not cross directories
    let first = with_timeout(engine.run(&["copy"])).await?;
    assert_eq!(first.stats.jobs, 1);

    ws.write("txt/c.txt", "gamma");
    assert_eq!(with_timeout(engine.run(&["copy"])).await?.stats.jobs, 1);
    assert_eq!(ws.read_target("txt/c.txt").as_deref(), Some("gamma"));

    ws.remove("txt/c.txt");
    let summary = with_timeout(engine.run(&["copy"])).await?;
    assert!(summary.success);
    assert_eq!(summary.stats.jobs, 0);
    assert_eq!(summary.stats.files_deleted, 1);
    assert_eq!(ws.read_target("txt/c.txt"), None);
    assert_eq!(ws.read_target("txt/a.txt").as_deref(), Some("alpha"));
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn state_file_is_deleted_once_no_job_remains() -> TestResult {
    init_tracing();
    let ws = Workspace::mock();
    ws.write("txt/a.txt", "alpha");

    let calls = Calls::new();
    let engine = start_copy(&ws, &calls);
    with_timeout(engine.run(&["copy"])).await?;
    assert!(ws.exists(&ws.state_file("copy")));

    ws.remove("txt/a.txt");
    let summary = with_timeout(engine.run(&["copy"])).await?;
    assert!(summary.success);
    assert!(!ws.exists(&ws.state_file("copy")));
    assert_eq!(ws.read_target("txt/a.txt"), None);
    engine.stop();
    Ok(())
}

#[tokio::test]
async fn copy_on_real_disk() -> TestResult {
    init_tracing();
    let ws = Workspace::disk();
    ws.write("txt/a.txt", "alpha");
    ws.write("txt/b.txt", "beta");

    let calls = Calls::new();
    let engine = start_copy(&ws, &calls);
    assert_eq!(with_timeout(engine.run(&["copy"])).await?.stats.jobs, 2);
    assert_eq!(with_timeout(engine.run(&["copy"])).await?.stats.jobs, 0);

    // mtimes are kept in milliseconds
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    ws.write("txt/b.txt", "beta 2");
    let summary = with_timeout(engine.run(&["copy"])).await?;
    assert_eq!(summary.stats.jobs, 1);
    assert_eq!(
        std::fs::read_to_string(ws.target_dir().join("txt/b.txt"))?,
        "beta 2"
    );
    assert!(ws.state_file("copy").exists());
    engine.stop();
    Ok(())
}
