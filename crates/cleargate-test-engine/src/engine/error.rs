//! Engine error types.

use thiserror::Error;

use crate::errors::{ConfigError, DiscoveryError};

/// Errors from [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// An error during engine construction.
    #[error("build error: {message}")]
    Build { message: String },
    /// Planning failed; nothing was executed.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    /// The executor configuration could not be read.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// The run task panicked or was aborted.
    #[error("run task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
