use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use tron::engine::RuntimeEvent;
use tron::node::{
    CommandLifecycle, CommandRequest, CommandRoute, Node, NodeError, NodeTransport, TaskCluster,
    TaskRequest,
};

type ExitFor = Arc<dyn Fn(&CommandRequest) -> Option<i32> + Send + Sync>;

/// A fake node transport that:
/// - records every submitted command and every stop request
/// - refuses submissions to nodes marked unreachable
/// - optionally reports Started / Exited / Done straight back into a
///   runtime channel, with the exit status chosen per request.
#[derive(Default)]
pub struct FakeTransport {
    submitted: Mutex<Vec<CommandRequest>>,
    stopped: Mutex<Vec<String>>,
    unreachable: Mutex<HashSet<String>>,
    responder: Mutex<Option<(mpsc::Sender<RuntimeEvent>, ExitFor)>>,
}

impl fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTransport")
            .field("submitted", &self.submitted.lock().unwrap().len())
            .field("stopped", &self.stopped.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every submission on `tx` with the status `exit_for` picks.
    pub fn auto_complete<F>(&self, tx: mpsc::Sender<RuntimeEvent>, exit_for: F)
    where
        F: Fn(&CommandRequest) -> Option<i32> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some((tx, Arc::new(exit_for)));
    }

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut nodes = self.unreachable.lock().unwrap();
        if unreachable {
            nodes.insert(node.to_string());
        } else {
            nodes.remove(node);
        }
    }

    /// Everything submitted since the last call.
    pub fn take_submitted(&self) -> Vec<CommandRequest> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }

    pub fn submitted(&self) -> Vec<CommandRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl NodeTransport for FakeTransport {
    fn submit(&self, node: &Node, request: CommandRequest) -> Result<(), NodeError> {
        if self.unreachable.lock().unwrap().contains(&node.name) {
            return Err(NodeError::Unreachable {
                node: node.name.clone(),
                reason: "marked unreachable by test".to_string(),
            });
        }
        debug!(node = %node.name, key = %request.key, "fake submit");
        self.submitted.lock().unwrap().push(request.clone());

        if let Some((tx, exit_for)) = self.responder.lock().unwrap().as_ref() {
            let exit = exit_for(&request);
            for lifecycle in [
                CommandLifecycle::Started,
                CommandLifecycle::Exited(exit),
                CommandLifecycle::Done,
            ] {
                let _ = tx.try_send(RuntimeEvent::Command {
                    route: request.route.clone(),
                    key: request.key.clone(),
                    lifecycle,
                });
            }
        }
        Ok(())
    }

    fn stop(&self, _node: &Node, key: &str) {
        self.stopped.lock().unwrap().push(key.to_string());
    }
}

/// A fake task cluster that records submissions, kills and recoveries.
#[derive(Debug)]
pub struct FakeCluster {
    submitted: Mutex<Vec<TaskRequest>>,
    killed: Mutex<Vec<String>>,
    recovered: Mutex<Vec<(String, CommandRoute)>>,
    recoverable: Mutex<bool>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            recovered: Mutex::new(Vec::new()),
            recoverable: Mutex::new(true),
        }
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `recover` finds the task it is asked about.
    pub fn set_recoverable(&self, recoverable: bool) {
        *self.recoverable.lock().unwrap() = recoverable;
    }

    pub fn take_submitted(&self) -> Vec<TaskRequest> {
        std::mem::take(&mut *self.submitted.lock().unwrap())
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn recovered(&self) -> Vec<(String, CommandRoute)> {
        self.recovered.lock().unwrap().clone()
    }
}

impl TaskCluster for FakeCluster {
    fn submit(&self, request: TaskRequest) -> Result<(), NodeError> {
        self.submitted.lock().unwrap().push(request);
        Ok(())
    }

    fn recover(&self, task_id: &str, route: CommandRoute) -> bool {
        self.recovered
            .lock()
            .unwrap()
            .push((task_id.to_string(), route));
        *self.recoverable.lock().unwrap()
    }

    fn kill(&self, task_id: &str) -> bool {
        self.killed.lock().unwrap().push(task_id.to_string());
        true
    }
}
