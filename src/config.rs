//! Service configuration
//!
//! Settings come from an optional YAML file; command-line flags and
//! environment variables override individual fields afterwards.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kubernetes::{ManifestOptions, OrchestratorConfig, RetryPolicy};
use crate::{Error, Result};

/// File looked up when no config path is given
pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub kubernetes: KubernetesConfig,
    pub tunnel: TunnelConfig,
    pub retry: RetryPolicy,
    pub generic: GenericConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port` or `:port`
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    /// Seconds a pod may stay pending
    pub start_timeout: u64,
    /// Seconds to wait for a deleted pod to go away
    pub delete_timeout: u64,
    pub poll_interval_ms: u64,
    pub image_pull_policy: Option<String>,
    pub termination_grace_period: u32,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
            start_timeout: 60,
            delete_timeout: 60,
            poll_interval_ms: 500,
            image_pull_policy: None,
            termination_grace_period: ManifestOptions::default().termination_grace_period,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub bind_address: IpAddr,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericConfig {
    pub verbose: bool,
    /// Log request and response bodies
    pub log_request: bool,
}

impl Config {
    /// Read a YAML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Load `explicit` if given, else the first `config.yaml` found in the
    /// working directory or `home`; defaults when there is none
    pub fn load(explicit: Option<&Path>, home: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let candidates = std::iter::once(PathBuf::from(CONFIG_FILE_NAME))
            .chain(home.map(|h| h.join(CONFIG_FILE_NAME)));
        for candidate in candidates {
            if candidate.is_file() {
                return Self::from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.kubernetes.namespace.trim().is_empty() {
            return Err(Error::Config("namespace cannot be empty".into()));
        }
        if self.kubernetes.start_timeout == 0 {
            return Err(Error::Config("start_timeout must be at least 1 second".into()));
        }
        if self.kubernetes.delete_timeout == 0 {
            return Err(Error::Config("delete_timeout must be at least 1 second".into()));
        }
        if self.kubernetes.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if let Some(policy) = &self.kubernetes.image_pull_policy {
            if !matches!(policy.as_str(), "Always" | "IfNotPresent" | "Never") {
                return Err(Error::Config(format!("unknown image pull policy: {}", policy)));
            }
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Parse `server.listen_addr`; a bare `:port` listens on all interfaces
    pub fn listen_addr(&self) -> Result<std::net::SocketAddr> {
        let raw = self.server.listen_addr.trim();
        let full = if raw.starts_with(':') {
            format!("0.0.0.0{}", raw)
        } else {
            raw.to_string()
        };
        full.parse()
            .map_err(|_| Error::Config(format!("invalid listen address: {}", raw)))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        let k = &self.kubernetes;
        let mut config = OrchestratorConfig::new()
            .start_timeout(Duration::from_secs(k.start_timeout))
            .delete_timeout(Duration::from_secs(k.delete_timeout))
            .poll_interval(Duration::from_millis(k.poll_interval_ms))
            .tunnel_bind(self.tunnel.bind_address)
            .retry(self.retry.clone())
            .termination_grace_period(k.termination_grace_period);
        if let Some(policy) = &k.image_pull_policy {
            config = config.image_pull_policy(policy.clone());
        }
        config
    }
}
