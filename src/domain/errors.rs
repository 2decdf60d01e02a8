//! Error taxonomy for the gator runtime.

use thiserror::Error;

/// Process exit code used when spec validation fails.
pub const EXIT_SPEC_ERROR: i32 = 3;
/// Process exit code used when the upward connection cannot be established.
pub const EXIT_CONNECT_FAILED: i32 = 2;
/// Process exit code used when any descendant job fails.
pub const EXIT_FAILURE: i32 = 1;

/// Errors that can occur anywhere in the gator runtime.
#[derive(Debug, Error)]
pub enum GatorError {
    /// Fatal specification problem detected before any child launches.
    #[error("spec error: {0}")]
    Spec(String),

    /// A peer sent something the protocol cannot accept. Non-fatal; the
    /// offending envelope is answered with an error response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The scheduler failed to launch a child or the child never phoned home.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// The upward connection was lost or could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A log-store operation failed or timed out.
    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type GatorResult<T> = Result<T, GatorError>;

impl GatorError {
    /// The process exit code this error class maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spec(_) | Self::Config(_) => EXIT_SPEC_ERROR,
            Self::Transport(_) => EXIT_CONNECT_FAILED,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<sqlx::Error> for GatorError {
    fn from(err: sqlx::Error) -> Self {
        GatorError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for GatorError {
    fn from(err: serde_json::Error) -> Self {
        GatorError::Protocol(format!("serialization failed: {err}"))
    }
}
