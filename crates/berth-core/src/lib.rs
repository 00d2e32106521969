//! # berth-core
//!
//! Session-scoped container sandboxes on top of Docker.
//!
//! Each session id gets at most one long-lived container. Callers run
//! commands in it with streamed, line-by-line output and move files in and
//! out as tar archives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     berth-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxRegistry │────▶│  HashMap<session id,     │    │
//! │  │   - run()       │     │          Arc<Sandbox>>   │    │
//! │  │   - remove()    │     └──────────────────────────┘    │
//! │  │   - list()      │                                     │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │    Sandbox      │────▶│  ExecHandle              │    │
//! │  │  - exec()       │     │  (line stream + wait)    │    │
//! │  │  - upload_file()│     └──────────────────────────┘    │
//! │  │  - download_…() │────▶ archive (tar pack/unpack)      │
//! │  └─────────────────┘                                     │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────────────────────────────────────┐     │
//! │  │ dyn ContainerRuntime                            │     │
//! │  │   DockerRuntime (bollard) | MemoryRuntime       │     │
//! │  └─────────────────────────────────────────────────┘     │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Docker Engine (local)                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use berth_core::{ExecRequest, SandboxConfig, SandboxRegistry};
//!
//! # async fn example() -> berth_core::Result<()> {
//! let config = SandboxConfig::builder()
//!     .image("ubuntu")
//!     .memory_limit("512m")
//!     .build()?;
//!
//! // First call fixes the configuration for the process.
//! let registry = SandboxRegistry::obtain(Some(config)).await?;
//! let sandbox = registry.run("session-1", None).await?;
//!
//! let mut handle = sandbox.exec(ExecRequest::shell_command("echo A && echo B")).await;
//! while let Some(line) = handle.next_line().await {
//!     println!("{line}");
//! }
//! println!("exit code: {}", handle.wait().await);
//!
//! sandbox.upload_file("./project", "/opt").await?;
//! sandbox.download_file("/opt/project/out.txt", "./out.txt").await?;
//!
//! registry.remove("session-1").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **One sandbox per session**: concurrent `run` calls share a single container
//! - **Streamed exec**: output arrives line by line; start failures are a handle variant, not an error
//! - **File transfer**: files and directory trees move as tar archives
//! - **Resource limits**: memory, CPU period/quota, network and privileged mode per registry
//! - **Port mapping**: publish the service port (e.g. a VNC bridge) on a chosen host port

pub mod archive;
mod command;
mod config;
mod error;
mod registry;
pub mod runtime;
mod sandbox;

pub use command::{
    ExecFailure, ExecHandle, ExecOutput, ExecRequest, RunningExec, FAILED_EXIT_CODE,
    UNKNOWN_EXIT_CODE,
};
pub use config::{parse_memory_limit, SandboxConfig, SandboxConfigBuilder};
pub use error::{CoreError, Result, RuntimeError};
pub use registry::{container_name, RegistryCell, SandboxRegistry};
pub use runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime, ScriptedExec};
pub use sandbox::{Sandbox, SandboxState};
