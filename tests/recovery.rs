use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tron::actionrun::backend::INITIAL_RECOVER_DELAY;
use tron::actionrun::{ActionRunState, EXIT_KUBERNETES_DISABLED, MAX_RECOVER_TRIES};
use tron::config::ConfigFile;
use tron::engine::{ActionRunOp, AdminCommand};
use tron::eventloop::TimerEvent;
use tron::node::{ClusterRepository, CommandLifecycle, CommandRequest};
use tron::serialize::{RestoredState, StateSource};
use tron::types::ExecutorType;
use tron_test_utils::{
    ConfigFileBuilder, FakeCluster, Harness, JobConfigBuilder, init_tracing,
};

const STATUS_PATH: &str = "/tmp/tron";
const EXEC_PATH: &str = "/opt/tron/bin";

fn config(with_runner: bool, executor: ExecutorType) -> ConfigFile {
    let mut builder = ConfigFileBuilder::new().with_node("box", "localhost");
    if with_runner {
        builder = builder.with_action_runner(STATUS_PATH, EXEC_PATH);
    }
    builder
        .with_job(
            "etl",
            JobConfigBuilder::new("box", "interval 1h")
                .action("build", "make")
                .executor("build", executor)
                .action_after("ship", "ship", &["build"])
                .build(),
        )
        .build()
}

fn action_state(h: &Harness, run_num: u64, action: &str) -> ActionRunState {
    h.core
        .job("etl")
        .and_then(|job| job.job().runs.get(run_num))
        .and_then(|run| run.action_runs().get(action))
        .map(|run| run.state())
        .expect("action run exists")
}

fn recovery_delays(h: &Harness) -> Vec<Duration> {
    h.event_loop
        .pending()
        .into_iter()
        .filter(|(_, event)| matches!(event, TimerEvent::SubmitRecovery { .. }))
        .map(|(delay, _)| delay)
        .collect()
}

/// Manually start `etl` and report `build` as started.
fn start_build(h: &mut Harness) -> CommandRequest {
    h.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    let build = h.take_one();
    h.send(&build, CommandLifecycle::Started);
    build
}

/// Stored state of a harness whose `etl.1.build` is running.
fn snapshot(h: &Harness) -> RestoredState {
    let job = h.core.job_state("etl").expect("job state");
    let runs = job
        .run_nums
        .iter()
        .filter_map(|&n| h.core.job_run_state("etl", n).map(|data| (n, data)))
        .collect::<HashMap<_, _>>();
    RestoredState {
        jobs: HashMap::from([("etl".to_string(), job)]),
        job_runs: HashMap::from([("etl".to_string(), runs)]),
        services: HashMap::new(),
    }
}

#[test]
fn lost_exit_status_walks_the_recovery_ladder_then_gives_up() {
    init_tracing();
    let mut h = Harness::new(&config(true, ExecutorType::Ssh));
    h.initialize();
    let build = start_build(&mut h);
    h.send(&build, CommandLifecycle::Exited(None));

    let mut expected = INITIAL_RECOVER_DELAY;
    for attempt in 0..MAX_RECOVER_TRIES {
        assert_eq!(recovery_delays(&h), vec![expected], "attempt {attempt}");
        assert_eq!(action_state(&h, 1, "build"), ActionRunState::Running);

        h.advance(expected);
        let probe = h.take_one();
        assert!(probe.key.starts_with("recovery-etl.1.build@"));
        assert_eq!(
            probe.command,
            "/opt/tron/bin/tron-recover-batch /tmp/tron/etl.1.build/status"
        );
        h.send(&probe, CommandLifecycle::Exited(None));
        expected *= 3;
    }

    assert!(recovery_delays(&h).is_empty());
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Unknown);
    assert_eq!(action_state(&h, 1, "ship"), ActionRunState::Queued);

    let run = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    let build = run.action_runs().get("build").unwrap();
    assert!(build.end_time().is_some());
    assert_eq!(build.exit_status(), None);
}

#[test]
fn refused_recovery_submissions_move_down_the_ladder() {
    init_tracing();
    let mut h = Harness::new(&config(true, ExecutorType::Ssh));
    h.initialize();
    let build = start_build(&mut h);
    h.send(&build, CommandLifecycle::Exited(None));
    h.transport.set_unreachable("box", true);

    let mut expected = INITIAL_RECOVER_DELAY;
    for attempt in 0..MAX_RECOVER_TRIES {
        assert_eq!(recovery_delays(&h), vec![expected], "attempt {attempt}");
        assert_eq!(action_state(&h, 1, "build"), ActionRunState::Running);
        h.advance(expected);
        assert!(h.take_submitted().is_empty());
        expected *= 3;
    }

    // Nothing left in flight: the run is UNKNOWN, not stuck RUNNING.
    assert!(recovery_delays(&h).is_empty());
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Unknown);
    let run = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    assert!(run.action_runs().get("build").unwrap().end_time().is_some());
    assert!(!run.is_active());
}

#[test]
fn node_back_after_a_refused_recovery_gets_the_next_attempt() {
    init_tracing();
    let mut h = Harness::new(&config(true, ExecutorType::Ssh));
    h.initialize();
    let build = start_build(&mut h);
    h.send(&build, CommandLifecycle::Exited(None));

    h.transport.set_unreachable("box", true);
    h.advance(INITIAL_RECOVER_DELAY);
    assert_eq!(recovery_delays(&h), vec![INITIAL_RECOVER_DELAY * 3]);

    h.transport.set_unreachable("box", false);
    h.advance(INITIAL_RECOVER_DELAY * 3);
    let probe = h.take_one();
    assert!(probe.key.starts_with("recovery-etl.1.build@"));
    h.complete(&probe, Some(0));
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Succeeded);
}

#[test]
fn restored_action_on_an_unreachable_node_retries_recovery_later() {
    init_tracing();
    let cfg = config(true, ExecutorType::Ssh);
    let mut before = Harness::new(&cfg);
    before.initialize();
    start_build(&mut before);

    let mut h = Harness::new(&cfg);
    h.transport.set_unreachable("box", true);
    h.initialize_from(snapshot(&before));

    assert!(h.take_submitted().is_empty());
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Running);
    assert_eq!(recovery_delays(&h), vec![INITIAL_RECOVER_DELAY]);

    h.transport.set_unreachable("box", false);
    h.advance(INITIAL_RECOVER_DELAY);
    let probe = h.take_one();
    assert!(probe.key.starts_with("recovery-etl.1.build@"));
}

#[test]
fn recovery_probe_can_report_the_real_exit_status() {
    init_tracing();
    let mut h = Harness::new(&config(true, ExecutorType::Ssh));
    h.initialize();
    let build = start_build(&mut h);
    h.send(&build, CommandLifecycle::Exited(None));

    h.advance(INITIAL_RECOVER_DELAY);
    let probe = h.take_one();
    h.complete(&probe, Some(2));

    let run = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    let build = run.action_runs().get("build").unwrap();
    assert_eq!(build.state(), ActionRunState::Failed);
    assert_eq!(build.exit_status(), Some(2));
    assert_eq!(run.state(), ActionRunState::Failed);
}

#[test]
fn restored_running_action_is_recovered_and_its_dependents_continue() {
    init_tracing();
    let cfg = config(true, ExecutorType::Ssh);
    let mut before = Harness::new(&cfg);
    before.initialize();
    start_build(&mut before);
    let restored = snapshot(&before);
    assert_eq!(restored.job_runs["etl"][&1].runs[0].state, ActionRunState::Running);

    let mut h = Harness::new(&cfg);
    h.initialize_from(restored);

    // The probe goes out straight away; the run is watched again.
    let probe = h.take_one();
    assert!(probe.key.starts_with("recovery-etl.1.build@"));
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Running);
    assert_eq!(action_state(&h, 0, "build"), ActionRunState::Scheduled);

    h.complete(&probe, Some(0));
    let build = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    let build = build.action_runs().get("build").unwrap();
    assert_eq!(build.state(), ActionRunState::Succeeded);
    assert_eq!(build.exit_status(), Some(0));

    let ship = h.take_one();
    assert!(ship.key.starts_with("etl.1.ship@"));
}

#[test]
fn restored_action_without_a_runner_stays_unknown() {
    init_tracing();
    let cfg = config(false, ExecutorType::Ssh);
    let mut before = Harness::new(&cfg);
    before.initialize();
    start_build(&mut before);

    let mut h = Harness::new(&cfg);
    h.initialize_from(snapshot(&before));

    assert!(h.take_submitted().is_empty());
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Unknown);
    let run = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    assert!(run.action_runs().get("build").unwrap().end_time().is_some());

    // An operator can settle it by hand.
    h.admin(AdminCommand::ActionRun {
        job: "etl".into(),
        run_num: 1,
        action: "build".into(),
        op: ActionRunOp::Success,
    });
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Succeeded);
    assert!(h.take_one().key.starts_with("etl.1.ship@"));
}

#[test]
fn restored_starting_action_is_failed() {
    init_tracing();
    let cfg = config(true, ExecutorType::Ssh);
    let mut before = Harness::new(&cfg);
    before.initialize();
    before.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    before.take_one();

    let mut h = Harness::new(&cfg);
    h.initialize_from(snapshot(&before));

    assert!(h.take_submitted().is_empty());
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Failed);
}

#[test]
fn task_actions_run_on_their_cluster() {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let clusters = ClusterRepository::new().with_cluster(ExecutorType::Mesos, cluster.clone());
    let mut h = Harness::with_clusters(&config(false, ExecutorType::Mesos), clusters);
    h.initialize();

    h.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    assert!(h.take_submitted().is_empty());
    let tasks = cluster.take_submitted();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert!(task.task_id.starts_with("etl.1.build."));
    assert_eq!(task.command, "make");

    let request = CommandRequest {
        key: task.task_id.clone(),
        route: task.route.clone(),
        command: task.command.clone(),
    };
    h.send(&request, CommandLifecycle::Started);
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Running);
    h.send(&request, CommandLifecycle::Exited(Some(0)));
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Succeeded);

    // Dependents on SSH still go to the node.
    assert!(h.take_one().key.starts_with("etl.1.ship@"));
}

#[test]
fn task_action_without_its_cluster_fails_immediately() {
    init_tracing();
    let mut h = Harness::new(&config(false, ExecutorType::Kubernetes));
    h.initialize();
    h.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });

    let run = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    let build = run.action_runs().get("build").unwrap();
    assert_eq!(build.state(), ActionRunState::Failed);
    assert_eq!(build.exit_status(), Some(EXIT_KUBERNETES_DISABLED));
    assert_eq!(run.state(), ActionRunState::Failed);
}

#[test]
fn restored_task_is_reattached_to_its_cluster() {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let clusters = ClusterRepository::new().with_cluster(ExecutorType::Mesos, cluster.clone());
    let cfg = config(false, ExecutorType::Mesos);

    let mut before = Harness::with_clusters(&cfg, clusters.clone());
    before.initialize();
    before.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    let task = cluster.take_submitted().remove(0);
    let request = CommandRequest {
        key: task.task_id.clone(),
        route: task.route.clone(),
        command: task.command.clone(),
    };
    before.send(&request, CommandLifecycle::Started);

    let mut h = Harness::with_clusters(&cfg, clusters);
    h.initialize_from(snapshot(&before));

    assert_eq!(cluster.recovered(), vec![(task.task_id.clone(), task.route.clone())]);
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Running);

    h.send(&request, CommandLifecycle::Exited(Some(0)));
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Succeeded);
}

#[test]
fn restored_task_unknown_to_the_cluster_stays_unknown() {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let clusters = ClusterRepository::new().with_cluster(ExecutorType::Mesos, cluster.clone());
    let cfg = config(false, ExecutorType::Mesos);

    let mut before = Harness::with_clusters(&cfg, clusters.clone());
    before.initialize();
    before.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    let task = cluster.take_submitted().remove(0);
    before.send(
        &CommandRequest {
            key: task.task_id.clone(),
            route: task.route.clone(),
            command: task.command.clone(),
        },
        CommandLifecycle::Started,
    );

    cluster.set_recoverable(false);
    let mut h = Harness::with_clusters(&cfg, clusters);
    h.initialize_from(snapshot(&before));

    assert_eq!(cluster.recovered().len(), 1);
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Unknown);
    let run = h.core.job("etl").unwrap().job().runs.get(1).unwrap();
    assert!(run.action_runs().get("build").unwrap().end_time().is_some());
}

#[test]
fn task_lost_while_watched_is_not_asked_about_after_a_restart() {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let clusters = ClusterRepository::new().with_cluster(ExecutorType::Mesos, cluster.clone());
    let cfg = config(false, ExecutorType::Mesos);

    let mut before = Harness::with_clusters(&cfg, clusters.clone());
    before.initialize();
    before.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    let task = cluster.take_submitted().remove(0);
    let request = CommandRequest {
        key: task.task_id.clone(),
        route: task.route.clone(),
        command: task.command.clone(),
    };
    before.send(&request, CommandLifecycle::Started);
    before.send(&request, CommandLifecycle::Exited(None));
    assert_eq!(action_state(&before, 1, "build"), ActionRunState::Unknown);

    let mut h = Harness::with_clusters(&cfg, clusters);
    h.initialize_from(snapshot(&before));

    assert!(cluster.recovered().is_empty());
    assert_eq!(action_state(&h, 1, "build"), ActionRunState::Unknown);
}

#[test]
fn killing_a_task_action_goes_through_the_cluster() {
    init_tracing();
    let cluster = Arc::new(FakeCluster::new());
    let clusters = ClusterRepository::new().with_cluster(ExecutorType::Mesos, cluster.clone());
    let mut h = Harness::with_clusters(&config(false, ExecutorType::Mesos), clusters);
    h.initialize();
    h.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    let task = cluster.take_submitted().remove(0);

    let step = h.admin(AdminCommand::ActionRun {
        job: "etl".into(),
        run_num: 1,
        action: "build".into(),
        op: ActionRunOp::Kill,
    });
    assert_eq!(
        step.commands[0],
        tron::engine::CoreCommand::AdminReply(Ok(format!("Sent kill for {}.", task.task_id)))
    );
    assert_eq!(cluster.killed(), vec![task.task_id]);
}
