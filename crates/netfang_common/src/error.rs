//! Error types shared by the daemon and its tooling.
//!
//! Configuration errors are fatal at startup. Store errors halt new
//! classification but never crash the daemon.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("plugin '{0}' is declared more than once")]
    DuplicatePlugin(String),

    #[error("plugin '{plugin}' depends on '{dependency}', which is unknown or disabled")]
    UnknownDependency { plugin: String, dependency: String },

    #[error("plugin dependency cycle involving '{member}'")]
    DependencyCycle { member: String },

    #[error("plugin '{0}' is enabled but no implementation is available")]
    MissingImplementation(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Poisoned,
}
