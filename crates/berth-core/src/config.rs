//! Sandbox configuration types.
//!
//! A [`SandboxConfig`] is handed to a [`SandboxRegistry`](crate::SandboxRegistry)
//! once and stays fixed for the registry's lifetime.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration shared by every sandbox a registry creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image name (default: "ubuntu").
    pub image_name: String,
    /// Image tag (default: "latest").
    pub image_tag: String,
    /// Working directory inside the container (default: "/opt").
    pub working_dir: String,
    /// Memory limit in docker notation, e.g. "512m" or "1g".
    pub memory_limit: Option<String>,
    /// CFS scheduler period in microseconds.
    pub cpu_period: Option<i64>,
    /// CFS scheduler quota in microseconds per period.
    pub cpu_quota: Option<i64>,
    /// Whether containers get a network (default: false).
    ///
    /// Requesting a host port mapping always enables the network.
    pub network_enabled: bool,
    /// Container port exposed to the host when a mapping is requested (default: 6080).
    pub service_port: u16,
    /// Run containers in privileged mode (default: false).
    pub privileged: bool,
    /// Environment variables set on every container.
    pub environment: BTreeMap<String, String>,
    /// Prefix of generated container names (default: "berth").
    pub name_prefix: String,
    /// Shell used for `shell` execs (default: "bash").
    pub shell: String,
    /// Grace period before the runtime kills a stopping container, in seconds (default: 10).
    pub stop_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image_name: "ubuntu".to_string(),
            image_tag: "latest".to_string(),
            working_dir: "/opt".to_string(),
            memory_limit: None,
            cpu_period: None,
            cpu_quota: None,
            network_enabled: false,
            service_port: 6080,
            privileged: false,
            environment: BTreeMap::new(),
            name_prefix: "berth".to_string(),
            shell: "bash".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Full image reference, `name:tag`.
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    /// Memory limit converted to bytes.
    pub fn memory_bytes(&self) -> Result<Option<i64>, CoreError> {
        self.memory_limit
            .as_deref()
            .map(parse_memory_limit)
            .transpose()
    }

    /// Stop grace period as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Environment rendered as `KEY=VALUE` bindings.
    pub fn env_bindings(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image_name.trim().is_empty() {
            return Err(CoreError::InvalidConfig("image_name is required".into()));
        }
        if self.image_tag.trim().is_empty() {
            return Err(CoreError::InvalidConfig("image_tag is required".into()));
        }
        if !self.working_dir.starts_with('/') {
            return Err(CoreError::InvalidConfig(format!(
                "working_dir must be absolute, got {:?}",
                self.working_dir
            )));
        }
        self.memory_bytes()?;
        if matches!(self.cpu_period, Some(p) if p <= 0) {
            return Err(CoreError::InvalidConfig("cpu_period must be > 0".into()));
        }
        if matches!(self.cpu_quota, Some(q) if q <= 0) {
            return Err(CoreError::InvalidConfig("cpu_quota must be > 0".into()));
        }
        if self.service_port == 0 {
            return Err(CoreError::InvalidConfig("service_port must be > 0".into()));
        }
        if self.shell.trim().is_empty() {
            return Err(CoreError::InvalidConfig("shell is required".into()));
        }
        if self.environment.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(CoreError::InvalidConfig(
                "environment keys must be non-empty and must not contain '='".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BERTH_IMAGE` | `ubuntu` |
    /// | `BERTH_IMAGE_TAG` | `latest` |
    /// | `BERTH_WORKDIR` | `/opt` |
    /// | `BERTH_MEMORY` | unset (no limit) |
    /// | `BERTH_CPU_PERIOD` | unset |
    /// | `BERTH_CPU_QUOTA` | unset |
    /// | `BERTH_NETWORK` | `false` |
    /// | `BERTH_SERVICE_PORT` | `6080` |
    /// | `BERTH_PRIVILEGED` | `false` |
    /// | `BERTH_SHELL` | `bash` |
    /// | `BERTH_ENV` | empty (`KEY=VALUE,KEY=VALUE`) |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            image_name: std::env::var("BERTH_IMAGE").unwrap_or(default.image_name),
            image_tag: std::env::var("BERTH_IMAGE_TAG").unwrap_or(default.image_tag),
            working_dir: std::env::var("BERTH_WORKDIR").unwrap_or(default.working_dir),
            memory_limit: std::env::var("BERTH_MEMORY")
                .ok()
                .filter(|v| !v.is_empty())
                .or(default.memory_limit),
            cpu_period: std::env::var("BERTH_CPU_PERIOD")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(default.cpu_period),
            cpu_quota: std::env::var("BERTH_CPU_QUOTA")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(default.cpu_quota),
            network_enabled: std::env::var("BERTH_NETWORK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.network_enabled),
            service_port: std::env::var("BERTH_SERVICE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.service_port),
            privileged: std::env::var("BERTH_PRIVILEGED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default.privileged),
            environment: std::env::var("BERTH_ENV")
                .map(|v| parse_env_list(&v))
                .unwrap_or(default.environment),
            shell: std::env::var("BERTH_SHELL").unwrap_or(default.shell),
            ..default
        }
    }
}

/// Parse a docker-style memory size ("512m", "1g", "2048k", "1073741824").
///
/// Units are binary multiples; an optional trailing `b` is accepted ("512mb").
pub fn parse_memory_limit(value: &str) -> Result<i64, CoreError> {
    let invalid = || CoreError::InvalidConfig(format!("invalid memory limit: {value:?}"));

    let lower = value.trim().to_ascii_lowercase();
    let digits_end = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(digits_end);
    let number: i64 = number.parse().map_err(|_| invalid())?;

    let multiplier: i64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    number.checked_mul(multiplier).ok_or_else(invalid)
}

fn parse_env_list(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, val)| (key.trim().to_string(), val.to_string()))
        .collect()
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the image name.
    pub fn image(mut self, name: impl Into<String>) -> Self {
        self.config.image_name = name.into();
        self
    }

    /// Set the image tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.config.image_tag = tag.into();
        self
    }

    /// Set the container working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.working_dir = dir.into();
        self
    }

    /// Set the memory limit ("512m").
    pub fn memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.config.memory_limit = Some(limit.into());
        self
    }

    /// Set CPU period and quota.
    pub fn cpu(mut self, period: i64, quota: i64) -> Self {
        self.config.cpu_period = Some(period);
        self.config.cpu_quota = Some(quota);
        self
    }

    /// Enable or disable container networking.
    pub fn network_enabled(mut self, enabled: bool) -> Self {
        self.config.network_enabled = enabled;
        self
    }

    /// Set the container service port used for host port mappings.
    pub fn service_port(mut self, port: u16) -> Self {
        self.config.service_port = port;
        self
    }

    /// Run containers privileged.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.config.privileged = privileged;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.environment.insert(key.into(), value.into());
        self
    }

    /// Set the container name prefix.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.name_prefix = prefix.into();
        self
    }

    /// Set the shell used for shell execs.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.config.shell = shell.into();
        self
    }

    /// Set the stop grace period in seconds.
    pub fn stop_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stop_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
