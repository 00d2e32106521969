//! Sandbox registry - maps sessions to running sandboxes.

use crate::config::SandboxConfig;
use crate::error::{CoreError, Result, RuntimeError};
use crate::runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
use crate::sandbox::Sandbox;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

/// Process-wide registry used by [`SandboxRegistry::obtain`].
static GLOBAL: RegistryCell = RegistryCell::new();

/// Owns every sandbox of a process, keyed by session id.
///
/// At most one sandbox exists per session. Creation and removal are
/// serialized by the registry lock, so concurrent [`run`](Self::run) calls for
/// the same session share one container.
pub struct SandboxRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
}

impl SandboxRegistry {
    /// Create a registry, pulling the configured image if it is not present.
    pub async fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Result<Self> {
        config.validate()?;

        let image = config.image_reference();
        ensure_image(runtime.as_ref(), &image)
            .await
            .map_err(|source| {
                tracing::error!(image = %image, error = %source, "Image is not available");
                CoreError::Initialization {
                    image: image.clone(),
                    source,
                }
            })?;

        tracing::info!(
            image = %image,
            working_dir = %config.working_dir,
            memory = ?config.memory_limit,
            network = config.network_enabled,
            "Sandbox registry ready"
        );

        Ok(Self {
            runtime,
            config,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Process-wide registry backed by the local Docker daemon.
    ///
    /// The first call must supply a config; later calls return the same
    /// registry and ignore any config they pass.
    pub async fn obtain(config: Option<SandboxConfig>) -> Result<Arc<Self>> {
        GLOBAL
            .obtain(config, || {
                DockerRuntime::connect().map(|rt| Arc::new(rt) as Arc<dyn ContainerRuntime>)
            })
            .await
    }

    /// Configuration shared by all sandboxes.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Sandbox for `session_id`, creating its container on first use.
    ///
    /// With `host_port`, the configured service port is published on that
    /// host port and networking is enabled regardless of the config.
    pub async fn run(&self, session_id: &str, host_port: Option<u16>) -> Result<Arc<Sandbox>> {
        if session_id.trim().is_empty() {
            return Err(CoreError::InvalidSession(session_id.to_string()));
        }

        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(existing) = sandboxes.get(session_id) {
            tracing::debug!(session_id = %session_id, "Reusing existing sandbox");
            return Ok(Arc::clone(existing));
        }

        let spec = self.container_spec(session_id, host_port)?;
        tracing::info!(
            session_id = %session_id,
            container = %spec.name,
            host_port = ?host_port,
            "Creating sandbox"
        );

        let container_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(source) => {
                tracing::error!(session_id = %session_id, error = %source, "Container creation failed");
                self.cleanup_partial(&spec.name, &sandboxes).await;
                return Err(CoreError::SandboxCreation {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        };

        if let Some(port) = host_port {
            self.verify_port_binding(&container_id, port).await;
        }

        let sandbox = Arc::new(Sandbox::new(
            container_id,
            session_id.to_string(),
            host_port,
            self.config.shell.clone(),
            self.config.stop_timeout(),
            Arc::clone(&self.runtime),
        ));
        sandboxes.insert(session_id.to_string(), Arc::clone(&sandbox));

        tracing::info!(
            session_id = %session_id,
            container_id = %sandbox.container_id(),
            total = sandboxes.len(),
            "Sandbox created"
        );
        Ok(sandbox)
    }

    /// Stop and delete the sandbox of `session_id`.
    ///
    /// Returns false when the session is unknown or teardown failed; a
    /// sandbox that could not be removed stays registered.
    pub async fn remove(&self, session_id: &str) -> bool {
        let mut sandboxes = self.sandboxes.lock().await;
        let Some(sandbox) = sandboxes.get(session_id).cloned() else {
            tracing::debug!(session_id = %session_id, "No sandbox to remove");
            return false;
        };

        match sandbox.remove().await {
            Ok(()) => {
                sandboxes.remove(session_id);
                true
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Sandbox removal failed, keeping entry");
                false
            }
        }
    }

    /// Remove every sandbox, returning how many were removed.
    pub async fn remove_all(&self) -> usize {
        let sessions = self.sessions().await;
        let mut removed = 0;
        for session_id in sessions {
            if self.remove(&session_id).await {
                removed += 1;
            }
        }
        tracing::info!(removed, "Removed all sandboxes");
        removed
    }

    /// All live sandboxes, ordered by session id.
    pub async fn list(&self) -> Vec<Arc<Sandbox>> {
        let mut sandboxes: Vec<_> = self.sandboxes.lock().await.values().cloned().collect();
        sandboxes.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        sandboxes
    }

    /// Session ids with a live sandbox, sorted.
    pub async fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<_> = self.sandboxes.lock().await.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Sandbox of `session_id`, if any.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().await.get(session_id).cloned()
    }

    /// Whether `session_id` has a live sandbox.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sandboxes.lock().await.contains_key(session_id)
    }

    /// Number of live sandboxes.
    pub async fn count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    /// Host port bindings of a session's container, as reported by the runtime.
    pub async fn port_bindings(&self, session_id: &str) -> Result<HashMap<String, Vec<u16>>> {
        let sandbox = self
            .get(session_id)
            .await
            .ok_or_else(|| CoreError::InvalidSession(session_id.to_string()))?;
        Ok(self.runtime.port_bindings(sandbox.container_id()).await?)
    }

    fn container_spec(&self, session_id: &str, host_port: Option<u16>) -> Result<ContainerSpec> {
        let mut port_bindings = HashMap::new();
        if let Some(port) = host_port {
            port_bindings.insert(self.service_port_key(), port);
        }

        Ok(ContainerSpec {
            name: container_name(&self.config.name_prefix, session_id),
            image: self.config.image_reference(),
            working_dir: self.config.working_dir.clone(),
            memory_bytes: self.config.memory_bytes()?,
            cpu_period: self.config.cpu_period,
            cpu_quota: self.config.cpu_quota,
            network_enabled: self.config.network_enabled || host_port.is_some(),
            privileged: self.config.privileged,
            env: self.config.env_bindings(),
            port_bindings,
        })
    }

    fn service_port_key(&self) -> String {
        format!("{}/tcp", self.config.service_port)
    }

    async fn verify_port_binding(&self, container_id: &str, expected: u16) {
        let key = self.service_port_key();
        match self.runtime.port_bindings(container_id).await {
            Ok(bindings) if bindings.get(&key).is_some_and(|ports| ports.contains(&expected)) => {
                tracing::debug!(container_id = %container_id, port = %key, host_port = expected, "Port binding verified");
            }
            Ok(bindings) => {
                tracing::warn!(
                    container_id = %container_id,
                    port = %key,
                    expected,
                    actual = ?bindings.get(&key),
                    "Port binding mismatch"
                );
            }
            Err(e) => {
                tracing::warn!(container_id = %container_id, error = %e, "Could not inspect port bindings");
            }
        }
    }

    /// Force-remove containers left behind by a failed creation.
    ///
    /// Containers owned by a registered sandbox are never touched.
    async fn cleanup_partial(&self, name: &str, live: &HashMap<String, Arc<Sandbox>>) {
        let leftovers = match self.runtime.list_containers(name).await {
            Ok(containers) => containers,
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Could not list containers for cleanup");
                return;
            }
        };

        for container in leftovers
            .into_iter()
            .filter(|c| c.names.iter().any(|n| n == name))
        {
            if live.values().any(|s| s.container_id() == container.id) {
                tracing::warn!(container_id = %container.id, "Skipping cleanup of a registered container");
                continue;
            }
            match self.runtime.remove_container(&container.id, true).await {
                Ok(()) => {
                    tracing::info!(container_id = %container.id, "Removed partially created container")
                }
                Err(e) => {
                    tracing::warn!(container_id = %container.id, error = %e, "Cleanup of partial container failed")
                }
            }
        }
    }
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Make sure `image` is present locally, pulling it when missing.
async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    image: &str,
) -> std::result::Result<(), RuntimeError> {
    if runtime.image_exists(image).await? {
        tracing::debug!(image = %image, "Image present");
        return Ok(());
    }
    tracing::info!(image = %image, "Pulling image");
    runtime.pull_image(image).await
}

/// Container name for a session: `{prefix}-{session}-{hash}`.
///
/// Characters Docker rejects are replaced by `-`; the hash suffix is derived
/// from the raw session id, so sessions that sanitize alike still get
/// distinct names.
pub fn container_name(prefix: &str, session_id: &str) -> String {
    let session: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, session_id.as_bytes()).simple().to_string();
    format!("{prefix}-{session}-{}", &digest[..8])
}

/// One-time holder for a shared [`SandboxRegistry`].
///
/// The first successful [`obtain`](Self::obtain) fixes the configuration for
/// the lifetime of the cell.
pub struct RegistryCell {
    cell: OnceCell<Arc<SandboxRegistry>>,
}

impl RegistryCell {
    /// Empty cell, usable in a `static`.
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// Registry held by the cell, if initialized.
    pub fn get(&self) -> Option<Arc<SandboxRegistry>> {
        self.cell.get().cloned()
    }

    /// Shared registry, initializing it with `config` and a runtime from
    /// `connect` on first use.
    pub async fn obtain<F>(
        &self,
        config: Option<SandboxConfig>,
        connect: F,
    ) -> Result<Arc<SandboxRegistry>>
    where
        F: FnOnce() -> std::result::Result<Arc<dyn ContainerRuntime>, RuntimeError>,
    {
        if let Some(registry) = self.cell.get() {
            if config.is_some() {
                tracing::debug!("Registry already initialized, ignoring supplied config");
            }
            return Ok(Arc::clone(registry));
        }

        let config = config.ok_or(CoreError::ConfigurationMissing)?;
        self.cell
            .get_or_try_init(|| async move {
                let runtime = connect().map_err(|source| CoreError::Initialization {
                    image: config.image_reference(),
                    source,
                })?;
                SandboxRegistry::new(runtime, config).await.map(Arc::new)
            })
            .await
            .cloned()
    }
}

impl Default for RegistryCell {
    fn default() -> Self {
        Self::new()
    }
}
