// src/actionrun/collection.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::action::ActionGraph;
use crate::actionrun::{ActionRun, ActionRunState, ActionRunStateData};

/// Aggregate predicates over every run, cleanup included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Running,
    Starting,
    Scheduled,
    Queued,
    Cancelled,
    Active,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Any,
    All,
}

impl Aggregate {
    fn strategy(self) -> Strategy {
        match self {
            // A run is only queued while nothing in it has moved on.
            Aggregate::Complete | Aggregate::Queued => Strategy::All,
            _ => Strategy::Any,
        }
    }

    fn holds_for(self, state: ActionRunState) -> bool {
        match self {
            Aggregate::Running => state == ActionRunState::Running,
            Aggregate::Starting => state == ActionRunState::Starting,
            Aggregate::Scheduled => state == ActionRunState::Scheduled,
            Aggregate::Queued => state == ActionRunState::Queued,
            Aggregate::Cancelled => state == ActionRunState::Cancelled,
            Aggregate::Active => state.is_active(),
            Aggregate::Complete => state.is_complete(),
        }
    }
}

/// The action runs of one job run, evaluated against the job's action graph.
pub struct ActionRunCollection {
    graph: Arc<ActionGraph>,
    runs: BTreeMap<String, ActionRun>,
    cleanup: Option<ActionRun>,
}

impl fmt::Debug for ActionRunCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionRunCollection[{}]", self.describe())
    }
}

impl ActionRunCollection {
    pub fn new(graph: Arc<ActionGraph>, runs: Vec<ActionRun>) -> Self {
        let mut by_name = BTreeMap::new();
        let mut cleanup = None;
        for run in runs {
            if run.is_cleanup() {
                cleanup = Some(run);
            } else {
                by_name.insert(run.action_name().to_string(), run);
            }
        }
        Self {
            graph,
            runs: by_name,
            cleanup,
        }
    }

    pub fn graph(&self) -> &Arc<ActionGraph> {
        &self.graph
    }

    /// Non-cleanup runs in name order.
    pub fn action_runs(&self) -> impl Iterator<Item = &ActionRun> {
        self.runs.values()
    }

    pub fn action_runs_with_cleanup(&self) -> impl Iterator<Item = &ActionRun> {
        self.runs.values().chain(self.cleanup.as_ref())
    }

    pub fn action_runs_with_cleanup_mut(&mut self) -> impl Iterator<Item = &mut ActionRun> {
        self.runs.values_mut().chain(self.cleanup.as_mut())
    }

    pub fn cleanup_action_run(&self) -> Option<&ActionRun> {
        self.cleanup.as_ref()
    }

    pub fn cleanup_action_run_mut(&mut self) -> Option<&mut ActionRun> {
        self.cleanup.as_mut()
    }

    pub fn get(&self, name: &str) -> Option<&ActionRun> {
        self.runs
            .get(name)
            .or_else(|| self.cleanup.as_ref().filter(|c| c.action_name() == name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ActionRun> {
        match self.runs.get_mut(name) {
            Some(run) => Some(run),
            None => self.cleanup.as_mut().filter(|c| c.action_name() == name),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.action_runs_with_cleanup().map(ActionRun::action_name)
    }

    pub fn aggregate(&self, aggregate: Aggregate) -> bool {
        let mut states = self.action_runs_with_cleanup().map(ActionRun::state);
        match aggregate.strategy() {
            Strategy::Any => states.any(|s| aggregate.holds_for(s)),
            Strategy::All => states.all(|s| aggregate.holds_for(s)),
        }
    }

    /// True if `name` is waiting on a required run that has not completed.
    pub fn is_blocked(&self, name: &str) -> bool {
        let Some(run) = self.runs.get(name) else {
            return false;
        };
        if run.is_done() || run.state().is_active() {
            return false;
        }
        self.graph
            .required_of(name)
            .filter_map(|required| self.runs.get(&required.name))
            .any(|required| !required.state().is_complete())
    }

    /// Non-cleanup runs that accept `start` and are not blocked.
    pub fn startable_names(&self) -> Vec<String> {
        self.runs
            .values()
            .filter(|run| run.check("start") && !self.is_blocked(run.action_name()))
            .map(|run| run.action_name().to_string())
            .collect()
    }

    pub fn has_startable(&self) -> bool {
        !self.startable_names().is_empty()
    }

    /// Nothing is running and every non-cleanup run is done or blocked.
    pub fn is_done(&self) -> bool {
        if self.aggregate(Aggregate::Running) {
            return false;
        }
        self.runs
            .values()
            .all(|run| run.is_done() || self.is_blocked(run.action_name()))
    }

    /// Done, with at least one failed run (cleanup included).
    pub fn is_failed(&self) -> bool {
        self.is_done()
            && self
                .action_runs_with_cleanup()
                .any(|run| run.state() == ActionRunState::Failed)
    }

    pub fn is_complete(&self) -> bool {
        self.aggregate(Aggregate::Complete)
    }

    pub fn is_complete_without_cleanup(&self) -> bool {
        self.runs.values().all(|run| run.state().is_complete())
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.action_runs_with_cleanup()
            .filter_map(ActionRun::start_time)
            .min()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        if !self.is_done() {
            return None;
        }
        self.action_runs_with_cleanup()
            .filter_map(ActionRun::end_time)
            .max()
    }

    pub fn state_data(&self) -> Vec<ActionRunStateData> {
        self.runs.values().map(ActionRun::state_data).collect()
    }

    pub fn cleanup_state_data(&self) -> Option<ActionRunStateData> {
        self.cleanup.as_ref().map(ActionRun::state_data)
    }

    /// `name(state)` per run, with `:blocked` on blocked ones.
    pub fn describe(&self) -> String {
        self.action_runs_with_cleanup()
            .map(|run| {
                let blocked = if self.is_blocked(run.action_name()) {
                    ":blocked"
                } else {
                    ""
                };
                format!("{}({}{})", run.action_name(), run.state(), blocked)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionRunner, CLEANUP_ACTION_NAME};
    use std::collections::BTreeSet;

    fn action(name: &str, requires: &[&str]) -> Action {
        Action {
            name: name.to_string(),
            command: format!("run {name}"),
            requires: requires.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            node: None,
            executor: Default::default(),
            retries: None,
            cpus: None,
            mem: None,
            docker_image: None,
        }
    }

    fn collection() -> ActionRunCollection {
        let graph = Arc::new(ActionGraph::new(
            vec![action("fetch", &[]), action("transform", &["fetch"])],
            Some(action(CLEANUP_ACTION_NAME, &[])),
        ));
        let runs = graph
            .actions()
            .chain(graph.cleanup())
            .map(|a| ActionRun::build("job", 0, a, None, ActionRunner::NoRunner))
            .collect();
        ActionRunCollection::new(graph, runs)
    }

    #[test]
    fn dependents_are_blocked_until_complete() {
        let mut c = collection();
        assert_eq!(c.startable_names(), ["fetch"]);
        assert!(c.is_blocked("transform"));

        c.get_mut("fetch").unwrap().success(Utc::now());
        // Operator override straight from SCHEDULED.
        assert!(!c.is_blocked("transform"));
        assert_eq!(c.startable_names(), ["transform"]);
    }

    #[test]
    fn failed_requirement_blocks_forever_and_finishes_collection() {
        let mut c = collection();
        c.get_mut("fetch").unwrap().fail(Some(1), Utc::now());

        assert!(c.is_blocked("transform"));
        assert!(c.startable_names().is_empty());
        assert!(c.is_done());
        assert!(c.is_failed());
        assert!(!c.is_complete());
        assert_eq!(c.describe(), "fetch(FAILED), transform(SCHEDULED:blocked), cleanup(SCHEDULED)");
    }

    #[test]
    fn cleanup_is_separate_from_action_runs() {
        let c = collection();
        assert_eq!(c.action_runs().count(), 2);
        assert_eq!(c.action_runs_with_cleanup().count(), 3);
        assert!(c.get(CLEANUP_ACTION_NAME).unwrap().is_cleanup());
        assert!(c.state_data().iter().all(|d| d.action_name != CLEANUP_ACTION_NAME));
        assert!(c.cleanup_state_data().is_some());
    }

    #[test]
    fn aggregates() {
        let mut c = collection();
        assert!(c.aggregate(Aggregate::Scheduled));
        assert!(!c.aggregate(Aggregate::Queued));
        for run in c.action_runs_with_cleanup_mut() {
            run.ready();
        }
        assert!(c.aggregate(Aggregate::Queued));
        assert!(!c.aggregate(Aggregate::Scheduled));

        c.get_mut("fetch").unwrap().success(Utc::now());
        assert!(!c.aggregate(Aggregate::Queued));

        let now = Utc::now();
        for run in c.action_runs_with_cleanup_mut() {
            run.success(now);
        }
        assert!(c.is_complete());
        assert!(c.is_done());
        assert_eq!(c.end_time(), Some(now));
    }
}
