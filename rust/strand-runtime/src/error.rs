//! Crate-level error types.
//!
//! Failures of *effects* are values of [`crate::cause::Cause`]; the types here
//! only cover the runtime itself (threads that could not be started, a
//! configuration file that could not be read).

use std::path::PathBuf;

/// Errors raised while starting or driving a [`crate::runtime::Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn worker thread {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn timer thread: {0}")]
    TimerSpawn(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while loading a [`crate::config::RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
}
