// src/serialize/watcher.rs

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::errors::{Result, TronError};
use crate::job::{JobRunStateData, JobStateData};
use crate::observer::{EventSpec, Observable};
use crate::serialize::{MCP_STATE_KEY, McpState, STATE_VERSION, StateItem, StateStore, StateType};
use crate::service::ServiceStateData;

/// Read access to the current state of the engine, by key.
pub trait StateSource {
    fn job_state(&self, job: &str) -> Option<JobStateData>;
    fn job_run_state(&self, job: &str, run_num: u64) -> Option<JobRunStateData>;
    fn service_state(&self, service: &str) -> Option<ServiceStateData>;
}

/// Everything read back from a store at startup.
#[derive(Debug, Default)]
pub struct RestoredState {
    pub jobs: HashMap<String, JobStateData>,
    /// Runs per job, keyed by run number.
    pub job_runs: HashMap<String, HashMap<u64, JobRunStateData>>,
    pub services: HashMap<String, ServiceStateData>,
}

/// Collects the keys touched by engine notifications and writes their
/// current state to the store on [`StateWatcher::flush`].
#[derive(Debug)]
pub struct StateWatcher {
    store: Box<dyn StateStore>,
    dirty: Arc<Mutex<BTreeSet<EngineEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn decode<T: DeserializeOwned>(state_type: StateType, key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(data) => Some(data),
        Err(err) => {
            warn!(%state_type, key, error = %err, "discarding unreadable stored state");
            None
        }
    }
}

fn encode<T: Serialize>(data: &T) -> Result<Value> {
    Ok(serde_json::to_value(data)?)
}

impl StateWatcher {
    pub fn new(store: Box<dyn StateStore>) -> Self {
        Self {
            store,
            dirty: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Subscribe to engine notifications.
    pub fn watch(&self, notifications: &Observable<EngineEvent>) {
        let dirty = Arc::clone(&self.dirty);
        notifications.attach(EventSpec::All, move |event: &EngineEvent| {
            lock(&dirty).insert(event.clone());
        });
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.dirty).is_empty()
    }

    /// Compare the stored state version with this build's and record ours.
    /// A store written by an incompatible version is refused.
    pub fn check_version(&mut self) -> Result<()> {
        let stored = self
            .store
            .restore(StateType::McpState, &[MCP_STATE_KEY.to_string()])?
            .remove(MCP_STATE_KEY);
        if let Some(value) = stored {
            let found: McpState = serde_json::from_value(value)?;
            if found.version != STATE_VERSION {
                return Err(TronError::StateVersionMismatch {
                    found: found.version,
                    expected: STATE_VERSION,
                });
            }
        }
        self.store.save(
            StateType::McpState,
            MCP_STATE_KEY,
            encode(&McpState {
                version: STATE_VERSION,
            })?,
        )
    }

    /// Read back the state of the named jobs (with their runs) and services.
    pub fn restore(&self, job_names: &[String], service_names: &[String]) -> Result<RestoredState> {
        let mut restored = RestoredState::default();

        for (name, value) in self.store.restore(StateType::JobState, job_names)? {
            if let Some(data) = decode::<JobStateData>(StateType::JobState, &name, value) {
                restored.jobs.insert(name, data);
            }
        }

        for (name, job) in &restored.jobs {
            let keys: Vec<String> = job
                .run_nums
                .iter()
                .map(|n| format!("{name}.{n}"))
                .collect();
            let mut runs = HashMap::new();
            for (key, value) in self.store.restore(StateType::JobRunState, &keys)? {
                if let Some(data) = decode::<JobRunStateData>(StateType::JobRunState, &key, value) {
                    runs.insert(data.run_num, data);
                }
            }
            restored.job_runs.insert(name.clone(), runs);
        }

        for (name, value) in self.store.restore(StateType::ServiceState, service_names)? {
            if let Some(data) = decode::<ServiceStateData>(StateType::ServiceState, &name, value) {
                restored.services.insert(name, data);
            }
        }

        info!(
            jobs = restored.jobs.len(),
            services = restored.services.len(),
            "restored state"
        );
        Ok(restored)
    }

    /// Write the current state of every key touched since the last flush.
    /// Returns how many keys were written or deleted.
    pub fn flush(&mut self, source: &dyn StateSource) -> Result<usize> {
        let dirty = std::mem::take(&mut *lock(&self.dirty));
        if dirty.is_empty() {
            return Ok(0);
        }

        let mut items = Vec::with_capacity(dirty.len());
        for event in &dirty {
            let item = match event {
                EngineEvent::JobChanged { job } => StateItem {
                    state_type: StateType::JobState,
                    key: job.clone(),
                    data: source.job_state(job).as_ref().map(encode).transpose()?,
                },
                EngineEvent::JobRunChanged { job, run_num }
                | EngineEvent::JobRunRemoved { job, run_num } => StateItem {
                    state_type: StateType::JobRunState,
                    key: format!("{job}.{run_num}"),
                    data: source
                        .job_run_state(job, *run_num)
                        .as_ref()
                        .map(encode)
                        .transpose()?,
                },
                EngineEvent::ServiceChanged { service } => StateItem {
                    state_type: StateType::ServiceState,
                    key: service.clone(),
                    data: source.service_state(service).as_ref().map(encode).transpose()?,
                },
            };
            items.push(item);
        }

        let count = items.len();
        if let Err(err) = self.store.save_many(items) {
            // Keep the keys so the next flush retries them.
            lock(&self.dirty).extend(dirty);
            return Err(err);
        }
        debug!(count, "flushed state");
        Ok(count)
    }

    pub fn shutdown(&mut self, source: &dyn StateSource) -> Result<()> {
        self.flush(source)?;
        self.store.cleanup()
    }
}
