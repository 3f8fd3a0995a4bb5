// src/engine/runtime.rs

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::serialize::StateWatcher;

use super::core::CoreRuntime;
use super::{CoreCommand, RuntimeEvent};

/// Async shell around [`CoreRuntime`].
///
/// Reads events from the channel that transports and timers write to,
/// feeds them to the core one at a time and executes the commands it
/// returns. State is persisted through the optional [`StateWatcher`].
#[derive(Debug)]
pub struct Runtime {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    watcher: Option<StateWatcher>,
}

impl Runtime {
    pub fn new(core: CoreRuntime, event_rx: mpsc::Receiver<RuntimeEvent>) -> Self {
        Self {
            core,
            event_rx,
            watcher: None,
        }
    }

    pub fn with_watcher(mut self, watcher: StateWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn core(&self) -> &CoreRuntime {
        &self.core
    }

    /// Main event loop. Returns the core once the loop stops so callers can
    /// inspect the final state.
    ///
    /// A failing flush is logged and the loop carries on; only the final
    /// flush on exit is reported to the caller.
    pub async fn run(mut self) -> Result<CoreRuntime> {
        info!("tron runtime started");

        loop {
            let Some(event) = self.event_rx.recv().await else {
                info!("runtime event channel closed; exiting");
                break;
            };
            debug!(?event, "runtime received event");

            let step = self.core.step(event);
            for command in step.commands {
                self.execute_command(command);
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        if let Some(watcher) = self.watcher.as_mut() {
            watcher.shutdown(&self.core)?;
        }
        info!("runtime exiting");
        Ok(self.core)
    }

    fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::FlushState => self.flush(),
            CoreCommand::AdminReply(Ok(message)) => info!(%message, "admin command applied"),
            CoreCommand::AdminReply(Err(message)) => warn!(%message, "admin command rejected"),
            CoreCommand::RequestExit => debug!("core issued RequestExit command"),
        }
    }

    fn flush(&mut self) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        if !watcher.has_pending() {
            return;
        }
        if let Err(err) = watcher.flush(&self.core) {
            error!(error = %err, "failed to persist state");
        }
    }
}
