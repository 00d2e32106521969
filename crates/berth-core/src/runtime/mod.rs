//! Container runtime abstraction.
//!
//! Everything berth needs from a container engine goes through the
//! [`ContainerRuntime`] trait. [`DockerRuntime`] talks to a local Docker
//! Engine via `bollard`; [`MemoryRuntime`] keeps containers in memory and is
//! meant for tests.

mod docker;
mod memory;

pub use docker::DockerRuntime;
pub use memory::{MemoryRuntime, ScriptedExec};

use crate::error::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Everything needed to create and start one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference (`name:tag`).
    pub image: String,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CFS period in microseconds.
    pub cpu_period: Option<i64>,
    /// CFS quota in microseconds.
    pub cpu_quota: Option<i64>,
    /// Whether the container gets a network.
    pub network_enabled: bool,
    /// Run privileged.
    pub privileged: bool,
    /// `KEY=VALUE` environment bindings.
    pub env: Vec<String>,
    /// Container port (`"6080/tcp"`) to host port.
    pub port_bindings: HashMap<String, u16>,
}

/// A container as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container names, without the leading `/`.
    pub names: Vec<String>,
}

/// A command invocation inside a running container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecSpec {
    /// Argument vector; the first element is the program.
    pub cmd: Vec<String>,
    /// `KEY=VALUE` environment bindings.
    pub env: Vec<String>,
    /// Working directory override.
    pub working_dir: Option<String>,
}

/// Which stream an output chunk was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A piece of exec output as it arrives from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Source stream.
    pub kind: StreamKind,
    /// Raw bytes; chunk boundaries need not align with lines.
    pub data: Bytes,
}

impl OutputChunk {
    /// Chunk written to stdout.
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            data: data.into(),
        }
    }

    /// Chunk written to stderr.
    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Output stream of a started exec.
pub type OutputStream = BoxStream<'static, Result<OutputChunk, RuntimeError>>;

/// A started exec: its runtime id plus the live output.
pub struct ExecSession {
    /// Runtime-assigned exec id, used to query the exit status.
    pub exec_id: String,
    /// Output chunks in arrival order. Ends when the process closes its streams.
    pub output: OutputStream,
}

/// Point-in-time status of an exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    /// Whether the process is still running.
    pub running: bool,
    /// Exit code once finished.
    pub exit_code: Option<i64>,
}

/// Operations berth consumes from a container engine.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check whether an image is present locally.
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;

    /// Pull an image by reference.
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Create and start a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// List all containers (running or not) whose name contains `name_filter`.
    async fn list_containers(&self, name_filter: &str)
        -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Stop a container, killing it after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Delete a container.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Unpack a tar archive into directory `path` inside the container.
    async fn put_archive(&self, id: &str, path: &str, archive: Vec<u8>)
        -> Result<(), RuntimeError>;

    /// Fetch `path` from the container as a tar archive.
    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Host port bindings of a container, keyed by container port (`"6080/tcp"`).
    async fn port_bindings(&self, id: &str) -> Result<HashMap<String, Vec<u16>>, RuntimeError>;

    /// Start a command inside a running container.
    async fn start_exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession, RuntimeError>;

    /// Query the status of a started exec.
    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError>;
}
