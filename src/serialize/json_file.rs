// src/serialize/json_file.rs

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{Result, TronError};
use crate::fs::FileSystem;
use crate::serialize::{StateItem, StateStore, StateType};

type Buckets = BTreeMap<StateType, BTreeMap<String, Value>>;

/// Every piece of state in one JSON object, rewritten atomically on each
/// batch:
///
/// ```json
/// {
///   "job_state": { "etl": { "enabled": true, "run_nums": [4, 3] } },
///   "job_run_state": { "etl.4": { ... } },
///   "service_state": { "web": { "enabled": true, "instances": [] } },
///   "mcp_state": { "mcp": { "version": 1 } }
/// }
/// ```
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    buckets: Buckets,
}

impl JsonFileStateStore {
    /// Open the store at `path`, loading existing state if the file exists.
    pub fn open(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let path = path.into();
        let buckets = if fs.exists(&path) {
            let text = fs
                .read_to_string(&path)
                .map_err(|e| TronError::StateStore(format!("{e:#}")))?;
            let buckets: Buckets = serde_json::from_str(&text)?;
            info!(path = %path.display(), "loaded state file");
            buckets
        } else {
            info!(path = %path.display(), "no state file, starting fresh");
            Buckets::new()
        };
        Ok(Self { path, fs, buckets })
    }

    fn write(&self) -> Result<()> {
        let text = serde_json::to_vec_pretty(&self.buckets)?;
        self.fs
            .write_atomic(&self.path, &text)
            .map_err(|e| TronError::StateStore(format!("{e:#}")))?;
        debug!(path = %self.path.display(), bytes = text.len(), "wrote state file");
        Ok(())
    }

    fn apply(&mut self, item: StateItem) {
        match item.data {
            Some(data) => {
                self.buckets
                    .entry(item.state_type)
                    .or_default()
                    .insert(item.key, data);
            }
            None => {
                if let Some(bucket) = self.buckets.get_mut(&item.state_type) {
                    bucket.remove(&item.key);
                }
            }
        }
    }
}

impl StateStore for JsonFileStateStore {
    fn save(&mut self, state_type: StateType, key: &str, data: Value) -> Result<()> {
        self.save_many(vec![StateItem {
            state_type,
            key: key.to_string(),
            data: Some(data),
        }])
    }

    fn delete(&mut self, state_type: StateType, key: &str) -> Result<()> {
        self.save_many(vec![StateItem {
            state_type,
            key: key.to_string(),
            data: None,
        }])
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

    fn save_many(&mut self, items: Vec<StateItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        for item in items {
            self.apply(item);
        }
        self.write()
    }

    fn cleanup(&mut self) -> Result<()> {
        self.write()
    }
}
