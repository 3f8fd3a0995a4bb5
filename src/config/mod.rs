// src/config/mod.rs

//! Configuration loading and validation for tron.
//!
//! - TOML-backed data model (`model.rs`).
//! - Loading from disk (`loader.rs`).
//! - Validation of node references, action graphs and schedules
//!   (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_from_str};
pub use model::{
    ActionConfig, ActionRunnerConfig, ConfigFile, ConfigSection, JobConfig, NodeConfig,
    NodePoolConfig, RawConfigFile, ServiceConfig, parse_duration,
};
pub use validate::validate_config;
