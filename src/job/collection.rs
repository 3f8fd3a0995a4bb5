// src/job/collection.rs

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::actionrun::ActionRunState;
use crate::job::run::JobRun;
use crate::node::Node;

/// A job's runs, newest first, bounded by `run_limit`.
#[derive(Debug)]
pub struct JobRunCollection {
    run_limit: usize,
    runs: VecDeque<JobRun>,
}

impl JobRunCollection {
    pub fn new(run_limit: usize) -> Self {
        Self {
            run_limit: run_limit.max(1),
            runs: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JobRun> {
        self.runs.iter_mut()
    }

    /// Run numbers, newest first.
    pub fn run_nums(&self) -> Vec<u64> {
        self.runs.iter().map(|run| run.run_num).collect()
    }

    pub fn next_run_num(&self) -> u64 {
        self.runs.iter().map(|run| run.run_num + 1).max().unwrap_or(0)
    }

    /// Add a run, keeping newest-first order.
    pub fn insert(&mut self, run: JobRun) {
        let pos = self
            .runs
            .iter()
            .position(|existing| existing.run_num < run.run_num)
            .unwrap_or(self.runs.len());
        debug!(job_run = %run.id(), "adding job run");
        self.runs.insert(pos, run);
    }

    pub fn get(&self, run_num: u64) -> Option<&JobRun> {
        self.runs.iter().find(|run| run.run_num == run_num)
    }

    pub fn get_mut(&mut self, run_num: u64) -> Option<&mut JobRun> {
        self.runs.iter_mut().find(|run| run.run_num == run_num)
    }

    pub fn get_newest(&self, include_manual: bool) -> Option<&JobRun> {
        self.runs.iter().find(|run| include_manual || !run.manual)
    }

    pub fn get_runs_by_state(&self, state: ActionRunState) -> impl Iterator<Item = &JobRun> {
        self.runs.iter().filter(move |run| run.state() == state)
    }

    /// Scheduled or queued runs.
    pub fn get_pending(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter().filter(|run| run.is_pending())
    }

    pub fn has_pending(&self) -> bool {
        self.get_pending().next().is_some()
    }

    /// Runs that are starting or running, optionally only those on `node`.
    pub fn get_active<'a>(&'a self, node: Option<&'a Node>) -> impl Iterator<Item = &'a JobRun> {
        self.runs.iter().filter(move |run| {
            run.is_active()
                && node.is_none_or(|node| run.node().is_some_and(|n| n.name == node.name))
        })
    }

    /// The oldest queued run.
    pub fn get_first_queued(&self, node: Option<&Node>) -> Option<&JobRun> {
        self.runs.iter().rev().find(|run| {
            run.state() == ActionRunState::Queued
                && node.is_none_or(|node| run.node().is_some_and(|n| n.name == node.name))
        })
    }

    pub fn last_success(&self) -> Option<&JobRun> {
        self.get_runs_by_state(ActionRunState::Succeeded).next()
    }

    /// The newest run that is scheduled or running.
    pub fn next_to_finish(&self) -> Option<&JobRun> {
        self.runs.iter().find(|run| {
            matches!(
                run.state(),
                ActionRunState::Running | ActionRunState::Scheduled
            )
        })
    }

    /// Drop the oldest runs beyond `run_limit`.
    ///
    /// Nothing is pruned until the job has succeeded once, and the run
    /// holding the last success or the next one to finish is never dropped.
    pub fn remove_old_runs(&mut self) -> Vec<JobRun> {
        let Some(last_success) = self.last_success().map(|run| run.run_num) else {
            return Vec::new();
        };
        let next = self
            .next_to_finish()
            .or_else(|| self.runs.front())
            .map_or(last_success, |run| run.run_num);
        let keep = next.min(last_success);

        let mut removed = Vec::new();
        while self.runs.len() > self.run_limit {
            match self.runs.back() {
                Some(oldest) if oldest.run_num < keep => {}
                _ => break,
            }
            if let Some(run) = self.runs.pop_back() {
                info!(job_run = %run.id(), "removing old job run");
                removed.push(run);
            }
        }
        removed
    }
}
