//! Sandbox type - a running container bound to a session.

use crate::archive::{self, Extraction};
use crate::command::{ExecHandle, ExecRequest, RunningExec};
use crate::error::{CoreError, Result};
use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Container is running and accepts commands.
    Created,
    /// Container was stopped and deleted.
    Removed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Removed => write!(f, "Removed"),
        }
    }
}

/// A running sandbox container.
///
/// Handles are shared (`Arc<Sandbox>`) between the registry and callers.
/// Exec and file transfers may run concurrently; only [`remove`](Self::remove)
/// is serialized, and it does not hold up other operations while it waits
/// for the container to stop.
pub struct Sandbox {
    container_id: String,
    session_id: String,
    host_port: Option<u16>,
    created_at: DateTime<Utc>,
    shell: String,
    stop_grace: Duration,
    runtime: Arc<dyn ContainerRuntime>,
    removed: AtomicBool,
    teardown: Mutex<()>,
}

impl Sandbox {
    pub(crate) fn new(
        container_id: String,
        session_id: String,
        host_port: Option<u16>,
        shell: String,
        stop_grace: Duration,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            container_id,
            session_id,
            host_port,
            created_at: Utc::now(),
            shell,
            stop_grace,
            runtime,
            removed: AtomicBool::new(false),
            teardown: Mutex::new(()),
        }
    }

    /// Runtime container id.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Session this sandbox belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Host port bound to the service port, if one was requested.
    pub fn host_port(&self) -> Option<u16> {
        self.host_port
    }

    /// When the sandbox was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        if self.removed.load(Ordering::Acquire) {
            SandboxState::Removed
        } else {
            SandboxState::Created
        }
    }

    fn ensure_created(&self) -> Result<()> {
        let state = self.state();
        if state != SandboxState::Created {
            return Err(CoreError::InvalidState {
                expected: SandboxState::Created.to_string(),
                actual: state.to_string(),
            });
        }
        Ok(())
    }

    /// Start a command in the container.
    ///
    /// Never fails outright: if the command cannot be started the returned
    /// handle is [`ExecHandle::Failed`], which yields no output and exits
    /// with [`FAILED_EXIT_CODE`](crate::FAILED_EXIT_CODE).
    pub async fn exec(&self, request: ExecRequest) -> ExecHandle {
        if request.args.is_empty() {
            return ExecHandle::failed("empty command");
        }
        if let Err(e) = self.ensure_created() {
            tracing::warn!(session_id = %self.session_id, error = %e, "Exec on unavailable sandbox");
            return ExecHandle::failed(e.to_string());
        }

        let spec = request.to_spec(&self.shell);
        tracing::debug!(
            session_id = %self.session_id,
            container_id = %self.container_id,
            cmd = ?spec.cmd,
            "Starting exec"
        );

        match self.runtime.start_exec(&self.container_id, &spec).await {
            Ok(session) => ExecHandle::Running(RunningExec::new(
                session,
                Arc::clone(&self.runtime),
                request.merge_stderr,
            )),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    container_id = %self.container_id,
                    error = %e,
                    "Failed to start exec"
                );
                ExecHandle::failed(e.to_string())
            }
        }
    }

    /// Copy a host file or directory into `container_path` (an existing
    /// directory in the container).
    ///
    /// A directory arrives nested under its own base name.
    pub async fn upload_file(
        &self,
        host_path: impl AsRef<Path>,
        container_path: &str,
    ) -> Result<()> {
        let host_path = host_path.as_ref().to_path_buf();
        if !host_path.exists() {
            tracing::warn!(path = %host_path.display(), "Upload source does not exist");
            return Err(CoreError::SourceMissing(host_path));
        }
        if container_path.is_empty() {
            return Err(CoreError::InvalidPath("container path is empty".into()));
        }
        self.ensure_created()?;

        let (archive, size) = tokio::task::spawn_blocking({
            let host_path = host_path.clone();
            move || {
                let size = archive::content_size(&host_path);
                archive::pack(&host_path).map(|archive| (archive, size))
            }
        })
        .await
        .map_err(|e| CoreError::Archive(std::io::Error::other(e)))?
        .map_err(CoreError::Archive)?;

        tracing::info!(
            session_id = %self.session_id,
            host_path = %host_path.display(),
            container_path = %container_path,
            bytes = size,
            "Uploading to sandbox"
        );

        self.runtime
            .put_archive(&self.container_id, container_path, archive)
            .await?;
        Ok(())
    }

    /// Copy `container_path` out of the container to `host_path`.
    ///
    /// Missing parent directories of `host_path` are created. See
    /// [`archive`](crate::archive) for where the result lands.
    pub async fn download_file(
        &self,
        container_path: &str,
        host_path: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let host_path = host_path.as_ref().to_path_buf();
        if container_path.is_empty() {
            return Err(CoreError::InvalidPath("container path is empty".into()));
        }
        if host_path.as_os_str().is_empty() {
            return Err(CoreError::InvalidPath("host path is empty".into()));
        }
        self.ensure_created()?;

        if let Some(parent) = host_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let archive = self
            .runtime
            .get_archive(&self.container_id, container_path)
            .await?;
        tracing::debug!(
            session_id = %self.session_id,
            container_path = %container_path,
            bytes = archive.len(),
            "Downloaded archive"
        );

        let extraction = tokio::task::spawn_blocking({
            let host_path = host_path.clone();
            move || archive::unpack(&archive, &host_path)
        })
        .await
        .map_err(|e| CoreError::Archive(std::io::Error::other(e)))?
        .map_err(CoreError::Archive)?;

        let landed = match extraction {
            Extraction::Renamed { target } => target,
            Extraction::Extracted { dir, entries } => {
                tracing::debug!(dir = %dir.display(), entries, "Extracted archive");
                dir
            }
        };

        tracing::info!(
            session_id = %self.session_id,
            container_path = %container_path,
            host_path = %landed.display(),
            "Downloaded from sandbox"
        );
        Ok(landed)
    }

    /// Stop and delete the container.
    ///
    /// Calling this on an already removed sandbox is a no-op. A container
    /// that is already stopped or already gone counts as torn down, so a
    /// failed removal can be retried.
    pub async fn remove(&self) -> Result<()> {
        let _teardown = self.teardown.lock().await;
        if self.state() == SandboxState::Removed {
            tracing::debug!(session_id = %self.session_id, "Sandbox already removed");
            return Ok(());
        }

        tracing::info!(
            session_id = %self.session_id,
            container_id = %self.container_id,
            "Removing sandbox"
        );

        match self
            .runtime
            .stop_container(&self.container_id, self.stop_grace)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(container_id = %self.container_id, "Container already gone before stop");
            }
            Err(e) => {
                tracing::error!(container_id = %self.container_id, error = %e, "Failed to stop container");
                return Err(e.into());
            }
        }
        match self
            .runtime
            .remove_container(&self.container_id, false)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(container_id = %self.container_id, "Container already removed");
            }
            Err(e) => {
                tracing::error!(container_id = %self.container_id, error = %e, "Failed to remove container");
                return Err(e.into());
            }
        }

        self.removed.store(true, Ordering::Release);
        tracing::info!(session_id = %self.session_id, "Sandbox removed");
        Ok(())
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("container_id", &self.container_id)
            .field("session_id", &self.session_id)
            .field("host_port", &self.host_port)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerSpec, MemoryRuntime, ScriptedExec};
    use std::collections::HashMap;

    async fn sandbox(runtime: Arc<MemoryRuntime>) -> Sandbox {
        let spec = ContainerSpec {
            name: "berth-test".into(),
            image: "ubuntu:latest".into(),
            working_dir: "/opt".into(),
            memory_bytes: None,
            cpu_period: None,
            cpu_quota: None,
            network_enabled: false,
            privileged: false,
            env: Vec::new(),
            port_bindings: HashMap::new(),
        };
        let id = runtime.create_container(&spec).await.unwrap();
        Sandbox::new(
            id,
            "test".into(),
            None,
            "bash".into(),
            Duration::from_secs(1),
            runtime,
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Created.to_string(), "Created");
        assert_eq!(SandboxState::Removed.to_string(), "Removed");
    }

    #[tokio::test]
    async fn test_exec_streams_scripted_output() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(Arc::clone(&runtime)).await;
        runtime.push_exec(ScriptedExec::new(0).stdout("hi\n"));

        let output = sandbox.exec(ExecRequest::new(["echo", "hi"])).await.collect().await;
        assert_eq!(output.lines, vec!["hi"]);
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_exec_empty_args_fails() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(runtime).await;
        let handle = sandbox.exec(ExecRequest::new(Vec::<String>::new())).await;
        assert!(handle.is_failed());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(Arc::clone(&runtime)).await;

        sandbox.remove().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Removed);
        assert!(runtime.container_names().is_empty());
        sandbox.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_retries_after_failed_delete() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(Arc::clone(&runtime)).await;

        runtime.fail_next_remove();
        assert!(sandbox.remove().await.is_err());
        assert_eq!(sandbox.state(), SandboxState::Created);

        sandbox.remove().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Removed);
        assert!(runtime.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_remove_vanished_container() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(Arc::clone(&runtime)).await;
        runtime
            .remove_container(sandbox.container_id(), true)
            .await
            .unwrap();

        sandbox.remove().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Removed);
    }

    #[tokio::test]
    async fn test_exec_not_blocked_by_teardown() {
        let runtime = Arc::new(
            MemoryRuntime::new()
                .with_image("ubuntu:latest")
                .with_stop_delay(Duration::from_millis(500)),
        );
        let sandbox = Arc::new(sandbox(Arc::clone(&runtime)).await);

        let teardown = tokio::spawn({
            let sandbox = Arc::clone(&sandbox);
            async move { sandbox.remove().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        runtime.push_exec(ScriptedExec::new(0).stdout("still here\n"));
        let output = tokio::time::timeout(Duration::from_millis(200), async {
            sandbox.exec(ExecRequest::new(["echo", "still here"])).await.collect().await
        })
        .await
        .expect("exec should not wait for teardown");
        assert_eq!(output.lines, vec!["still here"]);
        assert_eq!(sandbox.state(), SandboxState::Created);

        teardown.await.unwrap().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Removed);
    }

    #[tokio::test]
    async fn test_operations_after_remove() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(runtime).await;
        sandbox.remove().await.unwrap();

        let mut handle = sandbox.exec(ExecRequest::new(["ls"])).await;
        assert_eq!(handle.wait().await, crate::FAILED_EXIT_CODE);

        let tmp = tempfile::TempDir::new().unwrap();
        let err = sandbox
            .download_file("/opt", tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_upload_missing_source() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(runtime).await;
        let err = sandbox
            .upload_file("/definitely/not/here", "/opt")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_empty_paths() {
        let runtime = Arc::new(MemoryRuntime::new().with_image("ubuntu:latest"));
        let sandbox = sandbox(runtime).await;
        assert!(matches!(
            sandbox.download_file("", "/tmp/x").await,
            Err(CoreError::InvalidPath(_))
        ));
        assert!(matches!(
            sandbox.download_file("/opt", "").await,
            Err(CoreError::InvalidPath(_))
        ));
    }
}
