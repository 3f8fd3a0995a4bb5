use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tron::actionrun::ActionRunState;
use tron::engine::{AdminCommand, CoreRuntime, Runtime, RuntimeEvent};
use tron::eventloop::TokioEventLoop;
use tron::fs::RealFileSystem;
use tron::node::{CommandRoute, NodeTransport};
use tron::serialize::{JsonFileStateStore, RestoredState, StateWatcher};
use tron_test_utils::{ConfigFileBuilder, FakeTransport, JobConfigBuilder, init_tracing, with_timeout};

#[tokio::test]
async fn runtime_runs_a_manual_job_and_persists_it() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("tron.json");

    let cfg = ConfigFileBuilder::new()
        .with_node("box", "localhost")
        .with_job(
            "etl",
            JobConfigBuilder::new("box", "interval 1h")
                .action("fetch", "fetch")
                .action_after("load", "load", &["fetch"])
                .cleanup("tidy")
                .build(),
        )
        .build();

    let (tx, rx) = mpsc::channel::<RuntimeEvent>(64);
    let transport = Arc::new(FakeTransport::new());
    // Only the cleanup fails; that alone fails the run.
    transport.auto_complete(tx.clone(), |request| match &request.route {
        CommandRoute::ActionRun { action, .. } if action == "cleanup" => Some(1),
        _ => Some(0),
    });
    let shared: Arc<dyn NodeTransport> = transport.clone();
    let pools = tron::build_node_pools(&cfg, shared).unwrap();
    let env = tron::build_env(&cfg, pools, Arc::new(TokioEventLoop::new(tx.clone()))).unwrap();

    let mut watcher = StateWatcher::new(Box::new(
        JsonFileStateStore::open(&state_path, Arc::new(RealFileSystem)).unwrap(),
    ));
    watcher.check_version().unwrap();
    watcher.watch(&env.notifications);

    let mut core = CoreRuntime::from_config(&cfg, env).unwrap();
    core.initialize(RestoredState::default());

    tx.send(RuntimeEvent::Admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    }))
    .await
    .unwrap();
    let shutdown = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = shutdown.send(RuntimeEvent::ShutdownRequested).await;
    });

    let core = with_timeout(Runtime::new(core, rx).with_watcher(watcher).run())
        .await
        .unwrap();

    let run = core.job("etl").unwrap().job().runs.get(1).unwrap();
    assert_eq!(run.state(), ActionRunState::Failed);
    let actions = run.action_runs();
    assert_eq!(actions.get("fetch").unwrap().state(), ActionRunState::Succeeded);
    assert_eq!(actions.get("load").unwrap().state(), ActionRunState::Succeeded);

    let submitted: Vec<String> = transport
        .submitted()
        .into_iter()
        .map(|request| request.command)
        .collect();
    assert_eq!(submitted, vec!["fetch", "load", "tidy"]);

    // The final flush left the run on disk.
    let reopened = StateWatcher::new(Box::new(
        JsonFileStateStore::open(&state_path, Arc::new(RealFileSystem)).unwrap(),
    ));
    let restored = reopened.restore(&["etl".to_string()], &[]).unwrap();
    assert_eq!(restored.jobs["etl"].run_nums, vec![1, 0]);
    let stored = &restored.job_runs["etl"][&1];
    assert!(stored.runs.iter().all(|r| r.state == ActionRunState::Succeeded));
    assert_eq!(
        stored.cleanup_run.as_ref().map(|r| r.state),
        Some(ActionRunState::Failed)
    );
}
