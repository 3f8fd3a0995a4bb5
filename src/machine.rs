// src/machine.rs

//! Finite state machine primitive shared by action runs, action commands and
//! service instances.
//!
//! States are plain tagged values; the transitions between them live in a
//! separate, immutable [`TransitionTable`] that every machine of one kind
//! shares. A transition re-applies the same event against each new state
//! until the table has no further edge for it, so a single event can cascade
//! through several states in one call.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use thiserror::Error;
use tracing::trace;

use crate::observer::{EventSpec, Observable};

/// A state value usable in a [`StateMachine`].
pub trait State: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Stable name used for persistence and logging.
    fn name(&self) -> &'static str;
}

/// Raised when re-applying an event would revisit a state already passed
/// through in the same call. Always a bug in a transition table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circular transition on event '{event}': state '{state}' visited twice")]
pub struct CircularTransitionError {
    pub event: String,
    pub state: &'static str,
}

/// `state -> event -> state` edges for one kind of machine.
#[derive(Debug)]
pub struct TransitionTable<S: State> {
    edges: HashMap<S, HashMap<&'static str, S>>,
    states: Vec<S>,
}

impl<S: State> Default for TransitionTable<S> {
    fn default() -> Self {
        Self {
            edges: HashMap::new(),
            states: Vec::new(),
        }
    }
}

impl<S: State> TransitionTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `from --event--> to`. Later registrations for the same
    /// `(from, event)` pair replace earlier ones.
    pub fn with(mut self, from: S, event: &'static str, to: S) -> Self {
        self.remember(from);
        self.remember(to);
        self.edges.entry(from).or_default().insert(event, to);
        self
    }

    /// Register a state with no outgoing edges.
    pub fn with_terminal(mut self, state: S) -> Self {
        self.remember(state);
        self
    }

    fn remember(&mut self, state: S) {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
    }

    pub fn destination(&self, from: S, event: &str) -> Option<S> {
        self.edges.get(&from).and_then(|edges| edges.get(event)).copied()
    }

    /// Look a state up by its persisted name.
    pub fn state_named(&self, name: &str) -> Option<S> {
        self.states.iter().copied().find(|s| s.name() == name)
    }

    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.states.iter().copied()
    }

    /// Events accepted from `from`, sorted by name.
    pub fn events_from(&self, from: S) -> Vec<&'static str> {
        let mut events: Vec<_> = self
            .edges
            .get(&from)
            .map(|edges| edges.keys().copied().collect())
            .unwrap_or_default();
        events.sort_unstable();
        events
    }
}

/// A single machine instance: current state plus per-hop observers.
pub struct StateMachine<S: State> {
    table: &'static TransitionTable<S>,
    initial: S,
    state: S,
    observers: Observable<S>,
}

impl<S: State> fmt::Debug for StateMachine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state)
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

impl<S: State> StateMachine<S> {
    pub fn new(table: &'static TransitionTable<S>, initial: S) -> Self {
        Self {
            table,
            initial,
            state: initial,
            observers: Observable::new(),
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn table(&self) -> &'static TransitionTable<S> {
        self.table
    }

    /// Destination of `event` from the current state, without mutating.
    pub fn check(&self, event: &str) -> Option<S> {
        self.table.destination(self.state, event)
    }

    /// Apply `event` repeatedly until the current state no longer accepts
    /// it. Observers are notified once per hop.
    ///
    /// Returns `Ok(true)` if at least one hop happened. On a cycle the
    /// machine is left in the last state reached before the repeat.
    pub fn transition(&mut self, event: &str) -> Result<bool, CircularTransitionError> {
        let mut visited = HashSet::from([self.state]);
        let mut moved = false;

        while let Some(next) = self.check(event) {
            if !visited.insert(next) {
                return Err(CircularTransitionError {
                    event: event.to_string(),
                    state: next.name(),
                });
            }
            trace!(from = self.state.name(), to = next.name(), event, "state transition");
            self.state = next;
            moved = true;
            self.observers.notify(&next);
        }
        Ok(moved)
    }

    /// Return to the initial state without notifying observers.
    pub fn reset(&mut self) {
        self.state = self.initial;
    }

    /// Put the machine directly into `state`, e.g. when restoring.
    pub fn force_state(&mut self, state: S) {
        self.state = state;
    }

    pub fn attach<F>(&self, spec: EventSpec<S>, handler: F)
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.observers.attach(spec, handler);
    }

    pub fn clear_observers(&self) {
        self.observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex, OnceLock};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        Warming,
        On,
        Flicker,
        Strobe,
    }

    impl State for Light {
        fn name(&self) -> &'static str {
            match self {
                Light::Off => "off",
                Light::Warming => "warming",
                Light::On => "on",
                Light::Flicker => "flicker",
                Light::Strobe => "strobe",
            }
        }
    }

    fn table() -> &'static TransitionTable<Light> {
        static TABLE: OnceLock<TransitionTable<Light>> = OnceLock::new();
        TABLE.get_or_init(|| {
            TransitionTable::new()
                .with(Light::Off, "power", Light::Warming)
                .with(Light::Warming, "power", Light::On)
                .with(Light::On, "cut", Light::Off)
                .with(Light::Flicker, "glitch", Light::Strobe)
                .with(Light::Strobe, "glitch", Light::Flicker)
        })
    }

    #[test]
    fn check_is_pure() {
        let machine = StateMachine::new(table(), Light::Off);
        assert_eq!(machine.check("power"), Some(Light::Warming));
        assert_eq!(machine.check("cut"), None);
        assert_eq!(machine.state(), Light::Off);
    }

    #[test]
    fn same_event_cascades_and_notifies_each_hop() {
        let mut machine = StateMachine::new(table(), Light::Off);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        machine.attach(EventSpec::All, move |s| sink.lock().unwrap().push(*s));

        assert_eq!(machine.transition("power"), Ok(true));
        assert_eq!(machine.state(), Light::On);
        assert_eq!(*seen.lock().unwrap(), vec![Light::Warming, Light::On]);
    }

    #[test]
    fn rejected_event_is_a_no_op() {
        let mut machine = StateMachine::new(table(), Light::Off);
        assert_eq!(machine.transition("cut"), Ok(false));
        assert_eq!(machine.state(), Light::Off);
    }

    #[test]
    fn revisiting_a_state_is_reported() {
        let mut machine = StateMachine::new(table(), Light::Flicker);
        let err = machine.transition("glitch").unwrap_err();
        assert_eq!(err.state, "flicker");
        assert_eq!(machine.state(), Light::Strobe);
    }

    #[test]
    fn reset_and_lookup_by_name() {
        let mut machine = StateMachine::new(table(), Light::Off);
        machine.transition("power").unwrap();
        machine.reset();
        assert_eq!(machine.state(), Light::Off);
        assert_eq!(table().state_named("warming"), Some(Light::Warming));
        assert_eq!(table().state_named("missing"), None);
        assert_eq!(table().events_from(Light::On), vec!["cut"]);
    }
}
