//! Engine adapter error types.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from the container daemon adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to container daemon: {0}")]
    Connect(String),

    #[error("unsupported daemon url: {0}")]
    UnsupportedDaemonUrl(String),

    #[error("daemon request failed: {0}")]
    Daemon(#[from] bollard::errors::Error),

    #[error("exec stream ended unexpectedly: {0}")]
    ExecStream(String),
}

impl EngineError {
    /// Whether the underlying daemon answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Daemon(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}
