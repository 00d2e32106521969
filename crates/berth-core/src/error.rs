//! Error types for berth-core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for berth-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors reported by a [`ContainerRuntime`](crate::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The addressed image, container, exec or path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The runtime daemon could not be reached.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Any other failure reported by the runtime API.
    #[error("runtime API error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// Whether this error means the addressed object is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            bollard::errors::Error::IOError { err } => Self::Unavailable(err.to_string()),
            other => Self::Api(other.to_string()),
        }
    }
}

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The sandbox image could not be made available at registry startup.
    #[error("failed to prepare image {image}: {source}")]
    Initialization {
        /// Image reference (`name:tag`)
        image: String,
        /// Underlying runtime failure
        #[source]
        source: RuntimeError,
    },

    /// The process-wide registry was requested before it was configured.
    #[error("sandbox registry is not initialized and no configuration was supplied")]
    ConfigurationMissing,

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Session identifiers must be non-empty.
    #[error("invalid session id: {0:?}")]
    InvalidSession(String),

    /// The runtime refused or failed to create the container.
    #[error("failed to create sandbox for session {session_id}: {source}")]
    SandboxCreation {
        /// Session that requested the sandbox
        session_id: String,
        /// Underlying runtime failure
        #[source]
        source: RuntimeError,
    },

    /// Upload source does not exist on the host.
    #[error("host path does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    /// A transfer path was empty or has no usable file name.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid sandbox state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Packing or unpacking an archive failed.
    #[error("archive error: {0}")]
    Archive(#[source] std::io::Error),

    /// Error from the container runtime
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
