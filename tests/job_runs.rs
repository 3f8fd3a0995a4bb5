use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tron::actionrun::{ActionRunState, EXIT_INVALID_COMMAND, EXIT_NODE_ERROR};
use tron::config::ConfigFile;
use tron::engine::{ActionRunOp, AdminCommand, CoreCommand, JobRunOp};
use tron::job::JobRun;
use tron::fs::mock::MockFileSystem;
use tron::node::{CommandLifecycle, CommandRequest, CommandRoute};
use tron::serialize::StateSource;
use tron_test_utils::{ConfigFileBuilder, Harness, JobConfigBuilder, init_tracing};

fn single_action(schedule: &str) -> JobConfigBuilder {
    JobConfigBuilder::new("box", schedule).action("fetch", "fetch")
}

fn config(job: JobConfigBuilder) -> ConfigFile {
    ConfigFileBuilder::new()
        .with_node("box", "localhost")
        .with_job("etl", job.build())
        .build()
}

fn start(h: &mut Harness) {
    let step = h.admin(AdminCommand::StartJob {
        job: "etl".into(),
        run_time: None,
    });
    assert!(matches!(step.commands[0], CoreCommand::AdminReply(Ok(_))));
}

fn run(h: &Harness, run_num: u64) -> &JobRun {
    h.core
        .job("etl")
        .and_then(|job| job.job().runs.get(run_num))
        .expect("job run exists")
}

fn action_state(h: &Harness, run_num: u64, action: &str) -> ActionRunState {
    run(h, run_num)
        .action_runs()
        .get(action)
        .expect("action run exists")
        .state()
}

fn action_name(request: &CommandRequest) -> &str {
    match &request.route {
        CommandRoute::ActionRun { action, .. } => action,
        other => panic!("not an action run: {other:?}"),
    }
}

#[test]
fn failed_action_blocks_dependents_and_still_runs_cleanup() {
    init_tracing();
    let cfg = config(
        JobConfigBuilder::new("box", "interval 1h")
            .action("fetch", "fetch")
            .action_after("transform", "transform", &["fetch"])
            .cleanup("report %(cleanup_job_status)s"),
    );
    let mut h = Harness::new(&cfg);
    h.initialize();

    h.advance(Duration::from_secs(3600));
    let fetch = h.take_one();
    assert!(fetch.key.starts_with("etl.0.fetch@"));
    h.complete(&fetch, Some(1));

    let cleanup = h.take_one();
    assert_eq!(action_name(&cleanup), "cleanup");
    assert_eq!(cleanup.command, "report FAILURE");
    h.complete(&cleanup, Some(0));

    assert!(h.take_submitted().is_empty());
    assert_eq!(action_state(&h, 0, "fetch"), ActionRunState::Failed);
    assert_ne!(action_state(&h, 0, "transform"), ActionRunState::Succeeded);
    assert_eq!(action_state(&h, 0, "cleanup"), ActionRunState::Succeeded);
    assert_eq!(run(&h, 0).state(), ActionRunState::Failed);
    assert!(run(&h, 0).end_time().is_some());
}

#[test]
fn exit_status_decides_the_action_outcome() {
    init_tracing();
    let cases = [
        (Some(0), ActionRunState::Succeeded),
        (Some(3), ActionRunState::Failed),
        (None, ActionRunState::Unknown),
    ];
    for (exit, expected) in cases {
        let mut h = Harness::new(&config(single_action("interval 1h")));
        h.initialize();
        start(&mut h);

        let fetch = h.take_one();
        h.complete(&fetch, exit);

        let action = run(&h, 1).action_runs().get("fetch").unwrap();
        assert_eq!(action.state(), expected, "exit {exit:?}");
        assert_eq!(action.exit_status(), exit);
        assert_eq!(run(&h, 1).state(), expected);
    }
}

#[test]
fn commands_are_rendered_once_and_reused_by_retries() {
    init_tracing();
    let cfg = config(
        JobConfigBuilder::new("box", "interval 1h")
            .action("fetch", "fetch %(actionname)s %(shortdate)s")
            .retries("fetch", 2)
            .enabled(false),
    );
    let mut h = Harness::new(&cfg);
    h.initialize();
    start(&mut h);

    let first = h.take_one();
    assert_eq!(first.command, "fetch fetch 2024-05-01");

    // A disabled job has no scheduled run, so the manual run is the first.
    assert!(first.key.starts_with("etl.0.fetch@"));

    // A retry a day later still runs the command rendered for the run.
    h.event_loop.set_now(tron_test_utils::start_time() + chrono::TimeDelta::days(1));
    h.complete(&first, Some(1));
    let second = h.take_one();
    assert_ne!(second.key, first.key);
    assert_eq!(second.command, first.command);

    h.complete(&second, Some(1));
    let third = h.take_one();
    h.complete(&third, Some(0));

    let action = run(&h, 0).action_runs().get("fetch").unwrap();
    assert_eq!(action.state(), ActionRunState::Succeeded);
    assert_eq!(action.exit_statuses(), &[Some(1), Some(1)]);
    assert_eq!(action.retries_remaining(), Some(0));
}

#[test]
fn retries_run_out_and_the_action_fails() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1h").retries("fetch", 1)));
    h.initialize();
    start(&mut h);

    let first = h.take_one();
    h.complete(&first, Some(2));
    let second = h.take_one();
    h.complete(&second, Some(4));

    assert!(h.take_submitted().is_empty());
    let action = run(&h, 1).action_runs().get("fetch").unwrap();
    assert_eq!(action.state(), ActionRunState::Failed);
    assert_eq!(action.exit_status(), Some(4));
}

#[test]
fn unreachable_node_fails_the_action_with_a_node_error() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1h")));
    h.initialize();
    h.transport.set_unreachable("box", true);
    start(&mut h);

    assert!(h.take_submitted().is_empty());
    let action = run(&h, 1).action_runs().get("fetch").unwrap();
    assert_eq!(action.state(), ActionRunState::Failed);
    assert_eq!(action.exit_status(), Some(EXIT_NODE_ERROR));
    assert_eq!(run(&h, 1).state(), ActionRunState::Failed);
}

#[test]
fn overlapping_run_is_queued_then_promoted() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1m")));
    h.initialize();

    h.advance(Duration::from_secs(60));
    let first = h.take_one();
    assert!(first.key.starts_with("etl.0.fetch@"));

    h.advance(Duration::from_secs(60));
    assert!(h.take_submitted().is_empty());
    assert_eq!(run(&h, 1).state(), ActionRunState::Queued);

    h.complete(&first, Some(0));
    let promoted = h.take_one();
    assert!(promoted.key.starts_with("etl.1.fetch@"));
    assert_eq!(run(&h, 0).state(), ActionRunState::Succeeded);
    assert_eq!(run(&h, 1).state(), ActionRunState::Starting);
}

#[test]
fn overlapping_run_is_cancelled_without_queueing() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1m").queueing(false)));
    h.initialize();

    h.advance(Duration::from_secs(60));
    h.take_one();
    h.advance(Duration::from_secs(60));

    assert!(h.take_submitted().is_empty());
    assert_eq!(run(&h, 1).state(), ActionRunState::Cancelled);
    assert_eq!(run(&h, 2).state(), ActionRunState::Scheduled);
    assert_eq!(h.core.job_state("etl").unwrap().run_nums, vec![2, 1, 0]);
}

#[test]
fn overlap_allowed_runs_concurrently() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1m").allow_overlap(true)));
    h.initialize();

    h.advance(Duration::from_secs(60));
    h.take_one();
    h.advance(Duration::from_secs(60));
    h.take_one();

    assert_eq!(run(&h, 0).state(), ActionRunState::Starting);
    assert_eq!(run(&h, 1).state(), ActionRunState::Starting);
}

#[test]
fn old_runs_are_pruned_but_the_last_success_is_kept() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1m").run_limit(2)));
    h.initialize();

    for _ in 0..3 {
        h.advance(Duration::from_secs(60));
        let request = h.take_one();
        if !request.key.starts_with("etl.2.") {
            h.complete(&request, Some(0));
        }
    }

    // Run 1 is the last success, run 2 is running and run 3 is scheduled.
    assert_eq!(h.core.job_state("etl").unwrap().run_nums, vec![3, 2, 1]);
    assert!(h.core.job_run_state("etl", 0).is_none());
}

#[test]
fn nothing_is_pruned_before_the_first_success() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1m").run_limit(1)));
    h.initialize();

    for _ in 0..3 {
        h.advance(Duration::from_secs(60));
        let request = h.take_one();
        h.complete(&request, Some(1));
    }

    assert_eq!(h.core.job_state("etl").unwrap().run_nums, vec![3, 2, 1, 0]);
}

#[test]
fn max_runtime_stops_the_active_run() {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_node("box", "localhost")
        .with_action_runner("/tmp/tron", "/opt/tron/bin")
        .with_job("etl", single_action("interval 1h").max_runtime("10m").build())
        .build();
    let mut h = Harness::new(&cfg);
    h.initialize();
    start(&mut h);

    let fetch = h.take_one();
    assert!(fetch.command.starts_with("/opt/tron/bin/action_runner.py"));
    h.send(&fetch, tron::node::CommandLifecycle::Started);

    h.advance(Duration::from_secs(600));
    let stop = h.take_one();
    assert_eq!(stop.key, "etl.1.fetch.terminate");
    assert!(stop.command.starts_with("/opt/tron/bin/action_status.py"));
    assert!(stop.command.ends_with("terminate etl.1.fetch"));
}

#[test]
fn max_runtime_leaves_finished_runs_alone() {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_node("box", "localhost")
        .with_action_runner("/tmp/tron", "/opt/tron/bin")
        .with_job("etl", single_action("interval 1h").max_runtime("10m").build())
        .build();
    let mut h = Harness::new(&cfg);
    h.initialize();
    start(&mut h);
    let fetch = h.take_one();
    h.complete(&fetch, Some(0));

    h.advance(Duration::from_secs(600));
    assert!(h.take_submitted().is_empty());
    assert_eq!(run(&h, 1).state(), ActionRunState::Succeeded);
}

#[test]
fn skipping_a_failed_action_unblocks_its_dependents() {
    init_tracing();
    let cfg = config(
        JobConfigBuilder::new("box", "interval 1h")
            .action("fetch", "fetch")
            .action_after("transform", "transform", &["fetch"]),
    );
    let mut h = Harness::new(&cfg);
    h.initialize();
    start(&mut h);

    let fetch = h.take_one();
    h.complete(&fetch, Some(1));
    assert_eq!(run(&h, 1).state(), ActionRunState::Failed);

    let step = h.admin(AdminCommand::ActionRun {
        job: "etl".into(),
        run_num: 1,
        action: "fetch".into(),
        op: ActionRunOp::Skip,
    });
    assert_eq!(
        step.commands[0],
        CoreCommand::AdminReply(Ok("etl.1.fetch now in state SKIPPED".into()))
    );

    let transform = h.take_one();
    assert_eq!(action_name(&transform), "transform");
    h.complete(&transform, Some(0));
    assert_eq!(run(&h, 1).state(), ActionRunState::Succeeded);
}

#[test]
fn job_run_admin_ops_report_the_resulting_state() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1h")));
    h.initialize();

    let step = h.admin(AdminCommand::JobRun {
        job: "etl".into(),
        run_num: 0,
        op: JobRunOp::Cancel,
    });
    assert_eq!(
        step.commands[0],
        CoreCommand::AdminReply(Ok("etl.0 now in state CANCELLED".into()))
    );

    let step = h.admin(AdminCommand::JobRun {
        job: "etl".into(),
        run_num: 0,
        op: JobRunOp::Cancel,
    });
    assert_eq!(
        step.commands[0],
        CoreCommand::AdminReply(Ok("Failed to cancel etl.0, currently CANCELLED".into()))
    );

    let step = h.admin(AdminCommand::JobRun {
        job: "etl".into(),
        run_num: 42,
        op: JobRunOp::Start,
    });
    assert_eq!(
        step.commands[0],
        CoreCommand::AdminReply(Err("Job run not found: etl.42".into()))
    );
}

#[test]
fn disabled_job_cancels_pending_runs_and_reenabling_schedules_again() {
    init_tracing();
    let mut h = Harness::new(&config(single_action("interval 1h")));
    h.initialize();

    h.admin(AdminCommand::DisableJob { job: "etl".into() });
    assert_eq!(run(&h, 0).state(), ActionRunState::Cancelled);
    h.advance(Duration::from_secs(3600));
    assert!(h.take_submitted().is_empty());

    h.admin(AdminCommand::EnableJob { job: "etl".into() });
    assert_eq!(run(&h, 1).state(), ActionRunState::Scheduled);
    h.advance(Duration::from_secs(3600));
    let fetch = h.take_one();
    assert!(fetch.key.starts_with("etl.1.fetch@"));
}

#[test]
fn finished_action_output_is_written_under_the_output_stream_dir() {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_node("box", "localhost")
        .with_output_stream_dir("/var/log/tron")
        .with_job(
            "etl",
            JobConfigBuilder::new("box", "interval 1h")
                .action("fetch", "fetch")
                .action_after("load", "load", &["fetch"])
                .build(),
        )
        .build();
    let fs = MockFileSystem::new();
    let mut h = Harness::with_fs(&cfg, Arc::new(fs.clone()));
    h.initialize();
    start(&mut h);
    assert_eq!(
        run(&h, 1).output_dir().map(|dir| dir.as_path()),
        Some(Path::new("/var/log/tron/etl/1"))
    );

    let fetch = h.take_one();
    h.send(&fetch, CommandLifecycle::Started);
    h.send(&fetch, CommandLifecycle::Stdout("rows: 10".into()));
    h.send(&fetch, CommandLifecycle::Stdout("rows: 20".into()));
    h.send(&fetch, CommandLifecycle::Stderr("slow mirror".into()));
    // Nothing is written while the action is still running.
    assert!(fs.contents("/var/log/tron/etl/1/fetch.stdout").is_none());
    h.send(&fetch, CommandLifecycle::Exited(Some(0)));
    h.send(&fetch, CommandLifecycle::Done);

    assert_eq!(
        fs.contents("/var/log/tron/etl/1/fetch.stdout").as_deref(),
        Some("rows: 10\nrows: 20\n")
    );
    assert_eq!(
        fs.contents("/var/log/tron/etl/1/fetch.stderr").as_deref(),
        Some("slow mirror\n")
    );

    let load = h.take_one();
    h.complete(&load, Some(2));
    assert_eq!(fs.contents("/var/log/tron/etl/1/load.stdout").as_deref(), Some(""));
}

#[test]
fn without_an_output_stream_dir_nothing_is_written() {
    init_tracing();
    let fs = MockFileSystem::new();
    let mut h = Harness::with_fs(&config(single_action("interval 1h")), Arc::new(fs.clone()));
    h.initialize();
    start(&mut h);
    assert!(run(&h, 1).output_dir().is_none());

    let fetch = h.take_one();
    h.send(&fetch, CommandLifecycle::Started);
    h.send(&fetch, CommandLifecycle::Stdout("hello".into()));
    h.send(&fetch, CommandLifecycle::Exited(Some(0)));
    assert_eq!(fs.write_count(), 0);
}

#[test]
fn date_offset_out_of_range_fails_the_action_without_submitting() {
    init_tracing();
    let job = JobConfigBuilder::new("box", "interval 1h").action("fetch", "fetch %(shortdate+99999999)s");
    let mut h = Harness::new(&config(job));
    h.initialize();
    start(&mut h);

    assert!(h.take_submitted().is_empty());
    let action = run(&h, 1).action_runs().get("fetch").unwrap();
    assert_eq!(action.state(), ActionRunState::Failed);
    assert_eq!(action.exit_status(), Some(EXIT_INVALID_COMMAND));
    assert_eq!(run(&h, 1).state(), ActionRunState::Failed);
}
