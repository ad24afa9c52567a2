// ABOUTME: Error taxonomy shared by every runner subsystem
// ABOUTME: Engine, storage and control-plane failures are translated here at the boundary

use bollard::errors::Error as DockerError;
use thiserror::Error;

/// Main error type for runner operations
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Container, image, build log or remote record absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Wrong architecture, invalid transition target or incompatible existing resource
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed reference or unmet precondition
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Engine, registry or control plane rejected our credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Engine or remote API unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// A polling deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Garbage collection refused to delete past its safety gate
    #[error("Too many orphaned {resource}: found {found}, threshold is {threshold}")]
    ThresholdExceeded {
        resource: &'static str,
        found: usize,
        threshold: usize,
    },

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unclassified engine failure
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RunnerError::NotFound(_))
    }

    /// Map an HTTP-style status code returned by a remote service
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::BadRequest(message),
            401 | 403 => Self::Unauthorized(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            408 | 504 => Self::Timeout(message),
            502 | 503 => Self::Network(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<DockerError> for RunnerError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => RunnerError::from_status(status_code, message),
            DockerError::RequestTimeoutError => {
                RunnerError::Timeout("container engine request timed out".to_string())
            }
            DockerError::SocketNotFoundError(path) => {
                RunnerError::Network(format!("container engine socket not found: {}", path))
            }
            DockerError::IOError { err } => RunnerError::Network(err.to_string()),
            other => RunnerError::Internal(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RunnerError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            RunnerError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            RunnerError::Internal(err.to_string())
        } else {
            RunnerError::Network(err.to_string())
        }
    }
}
