// src/action/graph.rs

use std::collections::BTreeMap;

use crate::action::{Action, CLEANUP_ACTION_NAME};
use crate::config::model::JobConfig;

/// A job's actions keyed by name, with both edge directions indexed.
///
/// Acyclicity and reference validity are checked in `config::validate`;
/// this only keeps adjacency for building runs and for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionGraph {
    actions: BTreeMap<String, Action>,
    dependents: BTreeMap<String, Vec<String>>,
    cleanup: Option<Action>,
}

impl ActionGraph {
    /// Build the graph for one job.
    pub fn from_config(job: &JobConfig) -> Self {
        let actions: BTreeMap<String, Action> = job
            .action
            .iter()
            .map(|(name, cfg)| (name.clone(), Action::from_config(name, cfg)))
            .collect();
        let cleanup = job
            .cleanup_action
            .as_ref()
            .map(|cfg| Action::from_config(CLEANUP_ACTION_NAME, cfg));
        Self::new(actions.into_values().collect(), cleanup)
    }

    pub fn new(actions: Vec<Action>, cleanup: Option<Action>) -> Self {
        let actions: BTreeMap<String, Action> =
            actions.into_iter().map(|a| (a.name.clone(), a)).collect();

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, action) in actions.iter() {
            for dep in action.requires.iter() {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
        }

        Self {
            actions,
            dependents,
            cleanup,
        }
    }

    /// Names of all non-cleanup actions, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    pub fn cleanup(&self) -> Option<&Action> {
        self.cleanup.as_ref()
    }

    /// Look up an action, including the cleanup action.
    pub fn get(&self, name: &str) -> Option<&Action> {
        if name == CLEANUP_ACTION_NAME {
            return self.cleanup.as_ref();
        }
        self.actions.get(name)
    }

    /// Actions listed in `name`'s `requires`.
    pub fn required_of(&self, name: &str) -> impl Iterator<Item = &Action> {
        self.actions
            .get(name)
            .into_iter()
            .flat_map(|a| a.requires.iter())
            .filter_map(|dep| self.actions.get(dep))
    }

    /// Actions that list `name` in their `requires`.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Actions with no requirements.
    pub fn roots(&self) -> impl Iterator<Item = &Action> {
        self.actions.values().filter(|a| a.requires.is_empty())
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
