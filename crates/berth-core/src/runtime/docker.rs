//! Docker Engine runtime backed by `bollard`.

use super::{
    ContainerRuntime, ContainerSpec, ContainerSummary, ExecSession, ExecSpec, ExecStatus,
    OutputChunk,
};
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Label attached to every container berth creates.
const MANAGED_BY_LABEL: (&str, &str) = ("managed-by", "berth");

/// [`ContainerRuntime`] talking to a Docker Engine.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon (socket, or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::Unavailable(format!(
                "failed to connect to Docker daemon: {e}. Is Docker running?"
            ))
        })?;
        tracing::debug!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Wrap an existing bollard client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

/// Split `name:tag` into its parts, leaving registry ports (`host:5000/img`) alone.
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (reference, "latest"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) => match RuntimeError::from(e) {
                RuntimeError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let (name, tag) = split_reference(reference);
        let options = CreateImageOptions {
            from_image: name.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect()
            .await?;
        tracing::debug!(image = %reference, events = progress.len(), "Image pulled");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .port_bindings
            .keys()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|(port, host_port)| {
                (
                    port.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            memory: spec.memory_bytes,
            cpu_period: spec.cpu_period,
            cpu_quota: spec.cpu_quota,
            privileged: Some(spec.privileged),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            // Keeps shell-entrypoint images alive without a foreground command.
            tty: Some(true),
            network_disabled: Some(!spec.network_enabled),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                MANAGED_BY_LABEL.0.to_string(),
                MANAGED_BY_LABEL.1.to_string(),
            )])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }

        self.docker
            .start_container::<String>(&response.id, None)
            .await?;

        tracing::debug!(container_id = %response.id, name = %spec.name, "Container started");
        Ok(response.id)
    }

    async fn list_containers(
        &self,
        name_filter: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name_filter.to_string()])]),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c
                        .names
                        .unwrap_or_default()
                        .into_iter()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .collect(),
                })
            })
            .collect())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        stopped(self.docker.stop_container(id, Some(options)).await)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn put_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let archive = self
            .docker
            .download_from_container(id, Some(options))
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        tracing::trace!(container_id = %id, path = %path, size = archive.len(), "Archive received");
        Ok(archive)
    }

    async fn port_bindings(&self, id: &str) -> Result<HashMap<String, Vec<u16>>, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let bindings = info
            .host_config
            .and_then(|hc| hc.port_bindings)
            .unwrap_or_default();

        Ok(bindings
            .into_iter()
            .map(|(port, hosts)| {
                let host_ports = hosts
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|b| b.host_port.and_then(|p| p.parse().ok()))
                    .collect();
                (port, host_ports)
            })
            .collect())
    }

    async fn start_exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.docker.create_exec(id, options).await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, .. } => {
                let output = output
                    .filter_map(|msg| async move {
                        match msg {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                Some(Ok(OutputChunk::stdout(message)))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(OutputChunk::stderr(message)))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(RuntimeError::from(e))),
                        }
                    })
                    .boxed();
                Ok(ExecSession {
                    exec_id: exec.id,
                    output,
                })
            }
            StartExecResults::Detached => Ok(ExecSession {
                exec_id: exec.id,
                output: futures::stream::empty().boxed(),
            }),
        }
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(ExecStatus {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }
}

/// Docker answers 304 when the container is already stopped.
fn stopped(result: Result<(), bollard::errors::Error>) -> Result<(), RuntimeError> {
    match result {
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => {
            tracing::debug!("Container already stopped");
            Ok(())
        }
        other => Ok(other?),
    }
}
