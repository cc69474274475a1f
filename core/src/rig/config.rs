//! Cluster configuration and registry.
//!
//! `ClusterConfig` describes one cluster: how to reach its access node over SSH,
//! where the rig keeps its files on shared storage, the tunables of the
//! allocation and deployment protocols, and per-operation retry overrides.
//! `ClusterRegistry` stores a collection of clusters with an optional default
//! and round-trips through a YAML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RigError};
use crate::rig::retry::RetryPolicies;


// ---------------------------------------------------------------------------
// SetupActions
// ---------------------------------------------------------------------------

/// Shell lines run before a recipe's main command (module loads, venvs, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetupActions {
    #[serde(default)]
    pub notebook: Vec<String>,
    #[serde(default)]
    pub compute_cluster: Vec<String>,
}


// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

/// Configuration for a single cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Short name used to reference this cluster.
    pub name: String,
    /// Access node hostname or IP address.
    pub host: String,
    /// Access node SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH user on the cluster.
    pub user: String,
    /// Path to an SSH private key, if not using the agent/default key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// Rig working directory on shared storage, relative to the remote home
    /// unless absolute.
    #[serde(default = "default_rig_dir")]
    pub rig_dir: String,
    /// Start a private sshd on every allocated node.
    #[serde(default = "default_true")]
    pub node_sshd: bool,
    /// Port assumed for a node when port discovery has nothing for it.
    #[serde(default = "default_ssh_port")]
    pub default_node_port: u16,
    /// Fail the allocation instead of falling back to `default_node_port`.
    #[serde(default)]
    pub strict_port_discovery: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// How long a deployment launch echoes the script's early output.
    #[serde(default = "default_capture")]
    pub capture_seconds: u64,
    #[serde(default = "default_grace")]
    pub teardown_grace_seconds: u64,
    /// Timeout applied to every remote command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    /// Upper bound on concurrent per-node operations.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Redeploys allowed for a worker that failed validation.
    #[serde(default = "default_redeploys")]
    pub max_redeploy_attempts: u32,
    #[serde(default)]
    pub retries: RetryPolicies,
    #[serde(default)]
    pub setup_actions: SetupActions,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_rig_dir() -> String {
    ".rig".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    3
}

fn default_capture() -> u64 {
    5
}

fn default_grace() -> u64 {
    1
}

fn default_command_timeout() -> u64 {
    120
}

fn default_max_workers() -> usize {
    8
}

fn default_redeploys() -> u32 {
    1
}

impl ClusterConfig {
    /// A config with every tunable at its default.
    pub fn new(name: &str, host: &str, user: &str) -> Self {
        ClusterConfig {
            name: name.to_string(),
            host: host.to_string(),
            port: default_ssh_port(),
            user: user.to_string(),
            ssh_key: None,
            rig_dir: default_rig_dir(),
            node_sshd: true,
            default_node_port: default_ssh_port(),
            strict_port_discovery: false,
            poll_interval_seconds: default_poll_interval(),
            capture_seconds: default_capture(),
            teardown_grace_seconds: default_grace(),
            command_timeout_seconds: default_command_timeout(),
            max_workers: default_max_workers(),
            max_redeploy_attempts: default_redeploys(),
            retries: RetryPolicies::new(),
            setup_actions: SetupActions::default(),
        }
    }

    /// Build the `user@host` string for the access node.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Path of `relative` inside the rig directory.
    pub fn rig_path(&self, relative: &str) -> String {
        format!("{}/{}", self.rig_dir.trim_end_matches('/'), relative)
    }

    /// Shared scratch directory for discovery files and deployment runtime dirs.
    pub fn tmp_dir(&self) -> String {
        self.rig_path("tmp")
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RigError::Config("cluster name is empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(RigError::Config(format!("cluster '{}': host is empty", self.name)));
        }
        if self.user.trim().is_empty() {
            return Err(RigError::Config(format!("cluster '{}': user is empty", self.name)));
        }
        if self.port == 0 || self.default_node_port == 0 {
            return Err(RigError::Config(format!("cluster '{}': ports must be non-zero", self.name)));
        }
        if self.rig_dir.trim().is_empty() {
            return Err(RigError::Config(format!("cluster '{}': rig_dir is empty", self.name)));
        }
        if self.max_workers == 0 {
            return Err(RigError::Config(format!("cluster '{}': max_workers must be positive", self.name)));
        }
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// ClusterRegistry
// ---------------------------------------------------------------------------

/// A collection of cluster configurations with an optional default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterRegistry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
}

impl ClusterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cluster. Fails if the config is invalid or the name is taken.
    pub fn add(&mut self, config: ClusterConfig) -> Result<()> {
        config.validate()?;
        if self.clusters.iter().any(|c| c.name == config.name) {
            return Err(RigError::Config(format!("cluster '{}' already exists", config.name)));
        }
        self.clusters.push(config);
        Ok(())
    }

    /// Remove a cluster by name, returning it. Clears the default if it matched.
    pub fn remove(&mut self, name: &str) -> Result<ClusterConfig> {
        let idx = self
            .clusters
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| RigError::Config(format!("cluster '{}' not found", name)))?;
        let removed = self.clusters.remove(idx);
        if self.default.as_deref() == Some(name) {
            self.default = None;
        }
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ClusterConfig> {
        self.clusters.iter_mut().find(|c| c.name == name)
    }

    pub fn list(&self) -> &[ClusterConfig] {
        &self.clusters
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Set the default cluster. Fails if the named cluster does not exist.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if self.get(name).is_none() {
            return Err(RigError::Config(format!("cluster '{}' not found", name)));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    /// Resolve an optional name to a cluster, falling back to the default.
    pub fn resolve(&self, name: Option<&str>) -> Result<&ClusterConfig> {
        let target = match name {
            Some(n) => n,
            None => self
                .default
                .as_deref()
                .ok_or_else(|| RigError::Config("no cluster specified and no default set".into()))?,
        };
        self.get(target)
            .ok_or_else(|| RigError::Config(format!("cluster '{}' not found", target)))
    }

    /// Parse and validate a registry from YAML.
    pub fn parse(yaml: &str) -> Result<ClusterRegistry> {
        if yaml.trim().is_empty() {
            return Ok(ClusterRegistry::new());
        }
        let registry: ClusterRegistry = serde_yaml::from_str(yaml)?;
        for config in &registry.clusters {
            config.validate()?;
        }
        let mut seen = std::collections::HashSet::new();
        for config in &registry.clusters {
            if !seen.insert(config.name.as_str()) {
                return Err(RigError::Config(format!("cluster '{}' defined twice", config.name)));
            }
        }
        if let Some(ref def) = registry.default {
            if registry.get(def).is_none() {
                return Err(RigError::Config(format!(
                    "default cluster '{}' not found in clusters list",
                    def
                )));
            }
        }
        Ok(registry)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load a registry file. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<ClusterRegistry> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClusterRegistry::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
