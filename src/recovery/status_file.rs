// src/recovery/status_file.rs

//! The action runner's status file, as read by `tron-recover-batch`.
//!
//! The runner appends one YAML document when the command starts and another
//! when it exits, so the file holds one or more `---`-separated documents
//! and the last one is current:
//!
//! ```yaml
//! ---
//! run_id: etl.4.fetch
//! command: ./fetch --all
//! pid: 4312
//! return_code: null
//! runner_pid: 4311
//! timestamp: 1714557600.2
//! ---
//! run_id: etl.4.fetch
//! command: ./fetch --all
//! pid: 4312
//! return_code: 0
//! runner_pid: 4311
//! timestamp: 1714557912.9
//! ```

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs::FileSystem;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Negative when the command was killed by signal `abs(return_code)`.
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub runner_pid: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// What the status file says about the action right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// The action is over; exit with `code`.
    Exited { code: i32, message: Option<String> },
    /// The runner is still alive; wait for the file to change.
    Running { runner_pid: u32 },
}

/// Liveness of local processes.
pub trait ProcessTable: Send + Sync + Debug {
    fn pid_exists(&self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by `/proc`.
#[derive(Debug, Clone, Default)]
pub struct ProcFs;

impl ProcessTable for ProcFs {
    fn pid_exists(&self, pid: u32) -> bool {
        Path::new("/proc").join(pid.to_string()).exists()
    }
}

/// Parse every document in `text` and return the last one.
///
/// A document that fails to parse (e.g. the runner is mid-write) is
/// skipped.
pub fn parse_last_entry(text: &str) -> Option<StatusEntry> {
    let mut last = None;
    for document in serde_yaml::Deserializer::from_str(text) {
        match Option::<StatusEntry>::deserialize(document) {
            Ok(Some(entry)) => last = Some(entry),
            Ok(None) => {}
            Err(err) => debug!(error = %err, "skipping unreadable status document"),
        }
    }
    last
}

/// Decide the outcome from the current contents of the status file.
pub fn check_status(
    fs: &dyn FileSystem,
    path: &Path,
    processes: &dyn ProcessTable,
) -> Result<RecoveryStatus> {
    let text = fs.read_to_string(path)?;
    let entry = parse_last_entry(&text).unwrap_or_default();

    if let Some(code) = entry.return_code {
        if code < 0 {
            warn!(signal = -code, "action run was killed by a signal");
        }
        return Ok(RecoveryStatus::Exited {
            code: code.abs(),
            message: None,
        });
    }

    match entry.runner_pid {
        Some(pid) if processes.pid_exists(pid) => Ok(RecoveryStatus::Running { runner_pid: pid }),
        Some(pid) => Ok(RecoveryStatus::Exited {
            code: 1,
            message: Some(format!(
                "Action runner pid {pid} no longer running. Assuming an exit of 1."
            )),
        }),
        None => Ok(RecoveryStatus::Exited {
            code: 1,
            message: Some(format!(
                "No action runner pid in {}. Assuming an exit of 1.",
                path.display()
            )),
        }),
    }
}

/// Block until the status file records an exit (or the runner dies) and
/// return the outcome.
///
/// The file is re-read whenever it changes and at least every
/// `poll_interval`, so a runner that dies without writing is noticed.
pub fn wait_for_exit(
    fs: &dyn FileSystem,
    path: impl Into<PathBuf>,
    processes: &dyn ProcessTable,
    poll_interval: Duration,
) -> Result<(i32, Option<String>)> {
    let path = path.into();
    if let RecoveryStatus::Exited { code, message } = check_status(fs, &path, processes)? {
        return Ok((code, message));
    }

    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher = RecommendedWatcher::new(tx, Config::default())
        .context("creating status file watcher")?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {:?}", path))?;
    debug!(path = %path.display(), "waiting for status file to change");

    loop {
        match rx.recv_timeout(poll_interval) {
            Ok(Ok(event)) => debug!(kind = ?event.kind, "status file event"),
            Ok(Err(err)) => warn!(error = %err, "status file watch error"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                anyhow::bail!("status file watcher stopped");
            }
        }
        if let RecoveryStatus::Exited { code, message } = check_status(fs, &path, processes)? {
            return Ok((code, message));
        }
    }
}
