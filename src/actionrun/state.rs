// src/actionrun/state.rs

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::machine::{State, TransitionTable};

/// Lifecycle of one action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionRunState {
    Scheduled,
    Queued,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
    Unknown,
}

impl ActionRunState {
    pub const ALL: [ActionRunState; 9] = [
        ActionRunState::Scheduled,
        ActionRunState::Queued,
        ActionRunState::Starting,
        ActionRunState::Running,
        ActionRunState::Succeeded,
        ActionRunState::Failed,
        ActionRunState::Cancelled,
        ActionRunState::Skipped,
        ActionRunState::Unknown,
    ];

    /// No further progress happens without an operator.
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            ActionRunState::Failed
                | ActionRunState::Succeeded
                | ActionRunState::Cancelled
                | ActionRunState::Skipped
                | ActionRunState::Unknown
        )
    }

    /// Succeeded or skipped: satisfies a dependency.
    pub fn is_complete(&self) -> bool {
        matches!(self, ActionRunState::Succeeded | ActionRunState::Skipped)
    }

    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            ActionRunState::Failed | ActionRunState::Cancelled | ActionRunState::Unknown
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ActionRunState::Starting | ActionRunState::Running)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl State for ActionRunState {
    fn name(&self) -> &'static str {
        match self {
            ActionRunState::Scheduled => "scheduled",
            ActionRunState::Queued => "queued",
            ActionRunState::Starting => "starting",
            ActionRunState::Running => "running",
            ActionRunState::Succeeded => "succeeded",
            ActionRunState::Failed => "failed",
            ActionRunState::Cancelled => "cancelled",
            ActionRunState::Skipped => "skipped",
            ActionRunState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActionRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_uppercase())
    }
}

pub(crate) fn action_run_table() -> &'static TransitionTable<ActionRunState> {
    static TABLE: OnceLock<TransitionTable<ActionRunState>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use ActionRunState::*;
        let mut table = TransitionTable::new()
            .with(Scheduled, "ready", Queued)
            .with(Scheduled, "queue", Queued)
            .with(Scheduled, "cancel", Cancelled)
            .with(Scheduled, "start", Starting)
            .with(Queued, "cancel", Cancelled)
            .with(Queued, "start", Starting)
            .with(Queued, "schedule", Scheduled)
            .with(Starting, "started", Running)
            .with(Starting, "fail", Failed)
            .with(Running, "fail", Failed)
            .with(Running, "fail_unknown", Unknown)
            .with(Running, "success", Succeeded)
            .with(Failed, "skip", Skipped)
            .with(Cancelled, "skip", Skipped)
            .with(Unknown, "running", Running)
            .with_terminal(Succeeded)
            .with_terminal(Skipped);
        // Operator overrides.
        for state in [Unknown, Queued, Scheduled] {
            table = table.with(state, "success", Succeeded).with(state, "fail", Failed);
        }
        table
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_states() {
        let ends: Vec<_> = ActionRunState::ALL.into_iter().filter(|s| s.is_end()).collect();
        assert_eq!(ends.len(), 5);
        assert!(!ActionRunState::Running.is_end());
    }

    #[test]
    fn table_shape() {
        let table = action_run_table();
        assert_eq!(
            table.events_from(ActionRunState::Scheduled),
            ["cancel", "fail", "queue", "ready", "start", "success"]
        );
        assert_eq!(table.events_from(ActionRunState::Succeeded), Vec::<&str>::new());
        assert_eq!(
            table.destination(ActionRunState::Unknown, "running"),
            Some(ActionRunState::Running)
        );
        assert_eq!(table.destination(ActionRunState::Running, "cancel"), None);
    }

    #[test]
    fn names_round_trip() {
        for state in ActionRunState::ALL {
            assert_eq!(ActionRunState::from_name(state.name()), Some(state));
        }
        assert_eq!(ActionRunState::Unknown.to_string(), "UNKNOWN");
    }
}
