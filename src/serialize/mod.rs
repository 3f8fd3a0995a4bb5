// src/serialize/mod.rs

//! Persistence of job, job run and service state.
//!
//! The engine never talks to a store directly. It notifies
//! [`EngineEvent`](crate::engine::EngineEvent)s; the [`StateWatcher`]
//! collects the affected keys and writes their current state on flush.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

pub mod json_file;
pub mod watcher;

pub use json_file::JsonFileStateStore;
pub use watcher::{RestoredState, StateSource, StateWatcher};

/// Bumped whenever the stored layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

/// Key under which [`McpState`] is stored.
pub const MCP_STATE_KEY: &str = "mcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    JobState,
    JobRunState,
    ServiceState,
    McpState,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateType::JobState => "job_state",
            StateType::JobRunState => "job_run_state",
            StateType::ServiceState => "service_state",
            StateType::McpState => "mcp_state",
        };
        f.write_str(s)
    }
}

/// State about the daemon itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpState {
    pub version: u32,
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct StateItem {
    pub state_type: StateType,
    pub key: String,
    /// `None` deletes the key.
    pub data: Option<Value>,
}

/// Storage backend for engine state. Keys are opaque strings such as a job
/// name or `"{job}.{run_num}"`.
pub trait StateStore: Send + fmt::Debug {
    fn save(&mut self, state_type: StateType, key: &str, data: Value) -> Result<()>;

    fn delete(&mut self, state_type: StateType, key: &str) -> Result<()>;

    /// Stored data for each of `keys` that exists.
    fn restore(&self, state_type: StateType, keys: &[String]) -> Result<HashMap<String, Value>>;

    /// Apply a batch of writes. Stores that write whole files override this
    /// to write once.
    fn save_many(&mut self, items: Vec<StateItem>) -> Result<()> {
        for item in items {
            match item.data {
                Some(data) => self.save(item.state_type, &item.key, data)?,
                None => self.delete(item.state_type, &item.key)?,
            }
        }
        Ok(())
    }

    /// Release resources before shutdown.
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Store that keeps everything in memory. Used for tests and when no
/// state path is configured.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    buckets: BTreeMap<StateType, BTreeMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, state_type: StateType, key: &str) -> Option<&Value> {
        self.buckets.get(&state_type)?.get(key)
    }

    pub fn keys(&self, state_type: StateType) -> Vec<String> {
        self.buckets
            .get(&state_type)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn save(&mut self, state_type: StateType, key: &str, data: Value) -> Result<()> {
        self.buckets
            .entry(state_type)
            .or_default()
            .insert(key.to_string(), data);
        Ok(())
    }

    fn delete(&mut self, state_type: StateType, key: &str) -> Result<()> {
        if let Some(bucket) = self.buckets.get_mut(&state_type) {
            bucket.remove(key);
        }
        Ok(())
    }

    fn restore(&self, state_type: StateType, keys: &[String]) -> Result<HashMap<String, Value>> {
        let Some(bucket) = self.buckets.get(&state_type) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| bucket.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }
}
