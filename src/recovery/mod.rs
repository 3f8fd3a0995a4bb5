// src/recovery/mod.rs

//! Resolving action runs left UNKNOWN by a restart.
//!
//! A restored run that was RUNNING lost its callbacks. SSH runs are probed
//! through the action runner's status file; task runs are re-attached to
//! their cluster task by id.

use tracing::{debug, info};

use crate::action::ActionRunner;
use crate::engine::env::EngineEnv;
use crate::job::JobRun;
use crate::types::ExecutorType;

pub mod status_file;

/// Action runs of `job_run` that need recovery, split into SSH runs and
/// task runs.
pub fn filter_action_runs_needing_recovery(job_run: &JobRun) -> (Vec<String>, Vec<String>) {
    let mut ssh = Vec::new();
    let mut tasks = Vec::new();
    for run in job_run.action_runs().action_runs_with_cleanup() {
        if !run.needs_recovery() {
            continue;
        }
        match run.executor() {
            ExecutorType::Ssh => ssh.push(run.action_name().to_string()),
            ExecutorType::Mesos | ExecutorType::Kubernetes => {
                tasks.push(run.action_name().to_string())
            }
        }
    }
    (ssh, tasks)
}

/// Recover one SSH action run, falling back to `master_runner` when the
/// run was stored without an action runner.
pub fn recover_action_run(
    job_run: &mut JobRun,
    action: &str,
    master_runner: &ActionRunner,
    env: &EngineEnv,
) -> bool {
    job_run
        .with_action_run(action, env, |run, _, env| {
            run.adopt_action_runner(master_runner);
            if !run.action_runner().is_enabled() {
                info!(action_run = %run.id(), "unable to recover action run: it has no action runner");
                return false;
            }
            run.recover(env)
        })
        .unwrap_or(false)
}

/// Start recovery for every restored job run. Returns how many action runs
/// were recovered (probe submitted or task re-attached).
pub fn launch_recovery_actionruns_for_job_runs<'a>(
    job_runs: impl IntoIterator<Item = &'a mut JobRun>,
    master_runner: &ActionRunner,
    env: &EngineEnv,
) -> usize {
    let mut recovered = 0;
    for job_run in job_runs {
        let (ssh, tasks) = filter_action_runs_needing_recovery(job_run);
        for action in ssh {
            if recover_action_run(job_run, &action, master_runner, env) {
                recovered += 1;
            } else {
                debug!(job_run = %job_run.id(), action = %action, "unable to recover action run");
            }
        }
        for action in tasks {
            let ok = job_run
                .with_action_run(&action, env, |run, _, env| run.recover(env))
                .unwrap_or(false);
            if ok {
                recovered += 1;
            }
        }
    }
    recovered
}
