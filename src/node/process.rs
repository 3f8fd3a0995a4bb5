// src/node/process.rs

//! Transport that runs commands as child processes.
//!
//! Local nodes run `sh -c <command>`; remote nodes run the same through
//! `ssh`. Connection establishment is serialized per node with a one-permit
//! semaphore, but once a child is spawned the permit is released, so many
//! commands can be in flight on one node at once.

use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CommandLifecycle, CommandRequest, CommandRoute, Node, NodeError, NodeTransport};
use crate::engine::RuntimeEvent;

/// `ssh` exits with 255 when the connection itself failed.
const SSH_CONNECTION_ERROR: i32 = 255;
/// How long a killed command's output readers may keep draining.
const KILL_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProcessTransport {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    active: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("active", &lock(&self.active).len())
            .finish_non_exhaustive()
    }
}

impl ProcessTransport {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            gates: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn gate_for(&self, node: &str) -> Arc<Semaphore> {
        let mut gates = lock(&self.gates);
        Arc::clone(
            gates
                .entry(node.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }
}

/// Everything needed to reach a node, detached from the `Node` borrow.
#[derive(Debug, Clone)]
struct Target {
    name: String,
    hostname: String,
    username: Option<String>,
    port: u16,
    local: bool,
}

impl Target {
    fn from_node(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            hostname: node.hostname.clone(),
            username: node.username.clone(),
            port: node.port,
            local: node.is_local(),
        }
    }

    fn command(&self, shell_command: &str) -> Command {
        if self.local {
            let mut c = Command::new("sh");
            c.arg("-c").arg(shell_command);
            return c;
        }
        let destination = match &self.username {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        };
        let mut c = Command::new("ssh");
        c.arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(destination)
            .arg("--")
            .arg(shell_command);
        c
    }
}

impl NodeTransport for ProcessTransport {
    fn submit(&self, node: &Node, request: CommandRequest) -> Result<(), NodeError> {
        if self.runtime_tx.is_closed() {
            return Err(NodeError::ShuttingDown {
                node: node.name.clone(),
            });
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|e| NodeError::Unreachable {
            node: node.name.clone(),
            reason: e.to_string(),
        })?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        lock(&self.active).insert(request.key.clone(), cancel_tx);

        let target = Target::from_node(node);
        let gate = self.gate_for(&node.name);
        let tx = self.runtime_tx.clone();
        let active = Arc::clone(&self.active);

        handle.spawn(async move {
            let key = request.key.clone();
            run_command(target, request, gate, tx, cancel_rx).await;
            lock(&active).remove(&key);
        });
        Ok(())
    }

    fn stop(&self, node: &Node, key: &str) {
        match lock(&self.active).remove(key) {
            Some(cancel) => {
                info!(node = %node.name, key, "stopping command");
                let _ = cancel.send(());
            }
            None => debug!(node = %node.name, key, "stop requested for unknown command"),
        }
    }
}

struct Reporter {
    tx: mpsc::Sender<RuntimeEvent>,
    route: CommandRoute,
    key: String,
}

impl Reporter {
    async fn send(&self, lifecycle: CommandLifecycle) {
        let event = RuntimeEvent::Command {
            route: self.route.clone(),
            key: self.key.clone(),
            lifecycle,
        };
        if self.tx.send(event).await.is_err() {
            debug!(key = %self.key, "runtime channel closed; dropping command event");
        }
    }
}

async fn run_command(
    target: Target,
    request: CommandRequest,
    gate: Arc<Semaphore>,
    tx: mpsc::Sender<RuntimeEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let reporter = Arc::new(Reporter {
        tx,
        route: request.route.clone(),
        key: request.key.clone(),
    });

    let spawned = match gate.acquire().await {
        Ok(_permit) => {
            let mut cmd = target.command(&request.command);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            cmd.spawn()
        }
        Err(closed) => Err(std::io::Error::other(closed)),
    };

    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            warn!(node = %target.name, key = %request.key, error = %err, "failed to start command");
            reporter.send(CommandLifecycle::Exited(None)).await;
            reporter.send(CommandLifecycle::Done).await;
            return;
        }
    };

    reporter.send(CommandLifecycle::Started).await;

    let readers = [
        child
            .stdout
            .take()
            .map(|out| forward_lines(out, Arc::clone(&reporter), CommandLifecycle::Stdout)),
        child
            .stderr
            .take()
            .map(|err| forward_lines(err, Arc::clone(&reporter), CommandLifecycle::Stderr)),
    ];

    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = &mut cancel_rx => {
            info!(node = %target.name, key = %request.key, "killing command");
            if let Err(e) = child.kill().await {
                warn!(key = %request.key, error = %e, "failed to kill command");
            }
            (child.wait().await, true)
        }
    };

    // Output is reported before the exit so consumers see a complete buffer.
    // Only the shell is killed: its orphans may hold the pipes open.
    for mut reader in readers.into_iter().flatten() {
        if !killed {
            let _ = reader.await;
        } else if tokio::time::timeout(KILL_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!(key = %request.key, "abandoning output of killed command");
            reader.abort();
        }
    }

    let exit = match status {
        Ok(status) => exit_code(&status, !target.local),
        Err(err) => {
            warn!(key = %request.key, error = %err, "failed to wait for command");
            None
        }
    };
    debug!(node = %target.name, key = %request.key, ?exit, "command exited");
    reporter.send(CommandLifecycle::Exited(exit)).await;
    reporter.send(CommandLifecycle::Done).await;
}

fn forward_lines<R>(
    stream: R,
    reporter: Arc<Reporter>,
    wrap: fn(String) -> CommandLifecycle,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            reporter.send(wrap(line)).await;
        }
    })
}

/// Exit status as reported to the engine: negative for signals, `None` when
/// ssh lost the connection and the remote outcome is unknown.
fn exit_code(status: &ExitStatus, remote: bool) -> Option<i32> {
    match status.code() {
        Some(SSH_CONNECTION_ERROR) if remote => None,
        Some(code) => Some(code),
        None => signal_code(status),
    }
}

#[cfg(unix)]
fn signal_code(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| -sig)
}

#[cfg(not(unix))]
fn signal_code(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn local_node(transport: Arc<dyn NodeTransport>) -> Node {
        Node::new("local", "localhost", None, 22, transport)
    }

    fn request(key: &str, command: &str) -> CommandRequest {
        CommandRequest {
            key: key.to_string(),
            route: CommandRoute::ActionRun {
                job: "j".into(),
                run_num: 0,
                action: "a".into(),
            },
            command: command.to_string(),
        }
    }

    async fn collect_until_done(rx: &mut mpsc::Receiver<RuntimeEvent>) -> Vec<CommandLifecycle> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("command did not finish")
                .expect("channel closed");
            if let RuntimeEvent::Command { lifecycle, .. } = event {
                let done = lifecycle == CommandLifecycle::Done;
                seen.push(lifecycle);
                if done {
                    return seen;
                }
            }
        }
    }

    #[tokio::test]
    async fn reports_output_and_exit_status() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = Arc::new(ProcessTransport::new(tx));
        let node = local_node(transport);

        node.submit_command(request("k1", "echo hello; exit 3")).unwrap();
        let events = collect_until_done(&mut rx).await;

        assert_eq!(events.first(), Some(&CommandLifecycle::Started));
        assert!(events.contains(&CommandLifecycle::Stdout("hello".into())));
        assert_eq!(
            &events[events.len() - 2..],
            &[CommandLifecycle::Exited(Some(3)), CommandLifecycle::Done]
        );
    }

    #[tokio::test]
    async fn stop_kills_the_process() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = Arc::new(ProcessTransport::new(tx));
        let node = local_node(transport);

        node.submit_command(request("k2", "sleep 30")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.stop("k2");

        let events = collect_until_done(&mut rx).await;
        assert!(events.contains(&CommandLifecycle::Exited(Some(-9))));
    }

    #[tokio::test]
    async fn stop_returns_even_if_a_grandchild_holds_the_output_open() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = Arc::new(ProcessTransport::new(tx));
        let node = local_node(transport);

        node.submit_command(request("k4", "echo begun; sleep 30 & wait"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        node.stop("k4");

        let events = collect_until_done(&mut rx).await;
        assert!(events.contains(&CommandLifecycle::Stdout("begun".into())));
        assert!(events.contains(&CommandLifecycle::Exited(Some(-9))));
        assert_eq!(events.last(), Some(&CommandLifecycle::Done));
    }

    #[test]
    fn submit_outside_a_runtime_is_a_node_error() {
        let (tx, _rx) = mpsc::channel(1);
        let transport = Arc::new(ProcessTransport::new(tx));
        let node = local_node(transport);
        let err = node.submit_command(request("k3", "true")).unwrap_err();
        assert!(matches!(err, NodeError::Unreachable { .. }));
    }
}
