// src/action/command.rs

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::machine::{State, StateMachine, TransitionTable};
use crate::node::CommandLifecycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    Pending,
    Running,
    Exiting,
    Complete,
    Failstart,
}

impl State for CommandState {
    fn name(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Running => "running",
            CommandState::Exiting => "exiting",
            CommandState::Complete => "complete",
            CommandState::Failstart => "failstart",
        }
    }
}

fn command_table() -> &'static TransitionTable<CommandState> {
    static TABLE: OnceLock<TransitionTable<CommandState>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use CommandState::*;
        TransitionTable::new()
            .with(Pending, "start", Running)
            .with(Pending, "exit", Failstart)
            .with(Running, "exit", Exiting)
            .with(Exiting, "close", Complete)
            .with_terminal(Complete)
            .with_terminal(Failstart)
    })
}

/// In-memory stdout/stderr for one command.
#[derive(Debug, Clone, Default)]
pub struct StringBufferStore {
    buffers: HashMap<&'static str, Vec<String>>,
}

impl StringBufferStore {
    pub const STDOUT: &'static str = "stdout";
    pub const STDERR: &'static str = "stderr";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, stream: &'static str, chunk: &str) {
        self.buffers.entry(stream).or_default().push(chunk.to_string());
    }

    /// Everything written to `stream`, with trailing whitespace removed.
    pub fn get_stream(&self, stream: &str) -> String {
        self.buffers
            .get(stream)
            .map(|parts| parts.concat().trim_end().to_string())
            .unwrap_or_default()
    }

    /// The chunks written to `stream`, one per line as the node sent them.
    pub fn lines(&self, stream: &str) -> impl Iterator<Item = &str> {
        self.buffers
            .get(stream)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

/// One command handed to a node, tracked from submission to exit.
///
/// The node reports `started`, output, `exited` and `done` for the
/// command's key; each maps to one transition of the command's machine.
#[derive(Debug)]
pub struct ActionCommand {
    /// Identifies which run the command belongs to, e.g. `job.3.fetch`.
    pub id: String,
    /// Unique per submission; the transport echoes it back.
    pub key: String,
    pub command: String,
    machine: StateMachine<CommandState>,
    pub exit_status: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    output: StringBufferStore,
}

impl ActionCommand {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        let key = format!("{}@{}", id, uuid::Uuid::new_v4().simple());
        Self {
            id,
            key,
            command: command.into(),
            machine: StateMachine::new(command_table(), CommandState::Pending),
            exit_status: None,
            start_time: None,
            end_time: None,
            output: StringBufferStore::new(),
        }
    }

    pub fn state(&self) -> CommandState {
        self.machine.state()
    }

    pub fn started(&mut self, now: DateTime<Utc>) -> bool {
        if self.machine.check("start").is_none() {
            return false;
        }
        self.start_time = Some(now);
        self.machine.transition("start").unwrap_or(false)
    }

    pub fn exited(&mut self, exit_status: Option<i32>, now: DateTime<Utc>) -> bool {
        if self.machine.check("exit").is_none() {
            return false;
        }
        self.end_time = Some(now);
        self.exit_status = exit_status;
        self.machine.transition("exit").unwrap_or(false)
    }

    pub fn done(&mut self) -> bool {
        if self.machine.check("close").is_none() {
            return false;
        }
        self.machine.transition("close").unwrap_or(false)
    }

    pub fn write_stdout(&mut self, chunk: &str) {
        self.output.write(StringBufferStore::STDOUT, chunk);
    }

    pub fn write_stderr(&mut self, chunk: &str) {
        self.output.write(StringBufferStore::STDERR, chunk);
    }

    pub fn output(&self) -> &StringBufferStore {
        &self.output
    }

    /// Feed one lifecycle callback and return the state afterwards if it
    /// changed.
    pub fn handle(&mut self, lifecycle: &CommandLifecycle, now: DateTime<Utc>) -> Option<CommandState> {
        let before = self.state();
        match lifecycle {
            CommandLifecycle::Started => {
                self.started(now);
            }
            CommandLifecycle::Stdout(chunk) => self.write_stdout(chunk),
            CommandLifecycle::Stderr(chunk) => self.write_stderr(chunk),
            CommandLifecycle::Exited(status) => {
                self.exited(*status, now);
            }
            CommandLifecycle::Done => {
                self.done();
            }
        }
        let after = self.state();
        if after == before {
            return None;
        }
        debug!(id = %self.id, from = before.name(), to = after.name(), "action command changed");
        Some(after)
    }

    pub fn is_unknown(&self) -> bool {
        self.exit_status.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.exit_status.is_some_and(|s| s != 0)
    }

    pub fn is_complete(&self) -> bool {
        self.state() == CommandState::Complete
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), CommandState::Complete | CommandState::Failstart)
    }
}
