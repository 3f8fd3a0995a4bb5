// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! Subsystems with their own failure vocabulary keep a small local error
//! type (`CircularTransitionError`, `NodeError`, `RenderError`); everything
//! that crosses a module boundary is folded into [`TronError`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TronError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cycle detected in action graph: {0}")]
    DagCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("State version mismatch: found {found}, expected {expected}")]
    StateVersionMismatch { found: u32, expected: u32 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job run not found: {0}")]
    JobRunNotFound(String),

    #[error("Action run not found: {0}")]
    ActionRunNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TronError>;
