//! Command implementations for the `rig` binary.
//!
//! Each function loads the cluster registry, does its work and returns the
//! text to print. Connecting to a cluster goes through `Cluster::connect`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rig_core::rig::allocation::request::{AllocationParameters, Bytes, Timeout, Walltime};
use rig_core::rig::config::{ClusterConfig, ClusterRegistry};
use rig_core::rig::sync::DeploymentSnapshot;
use rig_core::{Cluster, Result, RigError};
use uuid::Uuid;

/// `$RIG_CONFIG_DIR/clusters.yaml`, else `~/.config/rig/clusters.yaml`.
pub fn resolve_config_path() -> PathBuf {
    let dir = match std::env::var("RIG_CONFIG_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config").join("rig")
        }
    };
    dir.join("clusters.yaml")
}

fn connect(config_path: &Path, name: Option<&str>) -> Result<Cluster> {
    let registry = ClusterRegistry::load(config_path)?;
    let config = registry.resolve(name)?.clone();
    Cluster::connect(config)
}


// ---------------------------------------------------------------------------
// Cluster registry
// ---------------------------------------------------------------------------

pub struct NewCluster {
    pub name: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key: Option<String>,
    pub rig_dir: Option<String>,
    pub default: bool,
}

pub fn cluster_add(config_path: &Path, new: NewCluster) -> Result<String> {
    let mut registry = ClusterRegistry::load(config_path)?;
    let mut config = ClusterConfig::new(&new.name, &new.host, &new.user);
    config.port = new.port;
    config.ssh_key = new.key;
    if let Some(dir) = new.rig_dir {
        config.rig_dir = dir;
    }
    registry.add(config)?;
    if new.default || registry.list().len() == 1 {
        registry.set_default(&new.name)?;
    }
    registry.save(config_path)?;
    log::debug!("saved {}", config_path.display());
    Ok(format!("Added cluster '{}'", new.name))
}

pub fn cluster_remove(config_path: &Path, name: &str) -> Result<String> {
    let mut registry = ClusterRegistry::load(config_path)?;
    registry.remove(name)?;
    registry.save(config_path)?;
    Ok(format!("Removed cluster '{}'", name))
}

pub fn cluster_list(config_path: &Path) -> Result<String> {
    let registry = ClusterRegistry::load(config_path)?;
    Ok(format_registry(&registry))
}

pub fn cluster_default(config_path: &Path, name: &str) -> Result<String> {
    let mut registry = ClusterRegistry::load(config_path)?;
    registry.set_default(name)?;
    registry.save(config_path)?;
    Ok(format!("Default cluster is now '{}'", name))
}

fn format_registry(registry: &ClusterRegistry) -> String {
    if registry.list().is_empty() {
        return "No clusters configured".into();
    }
    let mut lines = Vec::new();
    for config in registry.list() {
        let marker = if registry.default_name() == Some(config.name.as_str()) { "*" } else { " " };
        lines.push(format!(
            "{} {:<16} {}:{}  rig dir {}",
            marker,
            config.name,
            config.user_at_host(),
            config.port,
            config.rig_dir
        ));
    }
    lines.join("\n")
}


// ---------------------------------------------------------------------------
// Allocations and deployments
// ---------------------------------------------------------------------------

pub struct AllocateRequest {
    pub nodes: u32,
    pub cores: u32,
    pub memory: Bytes,
    pub walltime: Walltime,
    pub native: Vec<String>,
    pub timeout: Option<u64>,
}

/// `KEY` or `KEY=VALUE` into the native argument map.
fn parse_native(args: &[String]) -> Result<BTreeMap<String, Option<String>>> {
    let mut native = BTreeMap::new();
    for arg in args {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.to_string())),
            None => (arg.trim(), None),
        };
        if key.is_empty() {
            return Err(RigError::Validation(format!("empty native argument in '{}'", arg)));
        }
        native.insert(key.to_string(), value);
    }
    Ok(native)
}

pub fn allocate(config_path: &Path, name: Option<&str>, req: AllocateRequest) -> Result<String> {
    let params = AllocationParameters {
        nodes: Some(req.nodes),
        cores: Some(req.cores),
        memory_per_node: Some(req.memory),
        walltime: Some(req.walltime),
        native_args: parse_native(&req.native)?,
    };
    let cluster = connect(config_path, name)?;
    let mut allocation = cluster.allocate(&params)?;
    let timeout = req.timeout.map(Timeout::seconds).unwrap_or(Timeout::Never);
    if let Err(e) = allocation.wait(timeout) {
        if let Err(cancel_err) = allocation.cancel() {
            log::warn!("could not cancel job {}: {}", allocation.job_id(), cancel_err);
        }
        return Err(e);
    }
    cluster.push(allocation.uuid(), DeploymentSnapshot::Allocation(allocation.snapshot()))?;

    let mut lines = vec![format!("Allocation {} (job {})", allocation.uuid(), allocation.job_id())];
    for node in allocation.nodes() {
        lines.push(format!(
            "  {}:{}",
            node.host().unwrap_or_else(|| "?".into()),
            node.port().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
        ));
    }
    if let Some(until) = allocation.earliest_allocated_until() {
        lines.push(format!("  until {}", until.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    Ok(lines.join("\n"))
}

pub fn list(config_path: &Path, name: Option<&str>) -> Result<String> {
    let cluster = connect(config_path, name)?;
    let pulled = cluster.pull()?;
    if pulled.is_empty() {
        return Ok("No deployments".into());
    }
    let mut lines = Vec::new();
    for allocation in &pulled.allocations {
        let hosts: Vec<String> = allocation.nodes().iter().filter_map(|n| n.host()).collect();
        lines.push(format!(
            "allocation       {}  job {}  {}",
            allocation.uuid(),
            allocation.job_id(),
            hosts.join(",")
        ));
    }
    for notebook in &pulled.notebooks {
        lines.push(format!("notebook         {}  {}", notebook.uuid(), notebook.local_url()));
    }
    for compute in &pulled.compute_clusters {
        lines.push(format!(
            "compute_cluster  {}  {} workers  {}",
            compute.uuid(),
            compute.workers().len(),
            compute.dashboard_url()
        ));
    }
    Ok(lines.join("\n"))
}

pub fn cancel(config_path: &Path, name: Option<&str>, uuid: Uuid) -> Result<String> {
    let cluster = connect(config_path, name)?;
    let mut pulled = cluster.pull()?;
    let cancelled = if let Some(a) = pulled.allocations.iter_mut().find(|a| a.uuid() == uuid) {
        a.cancel()?;
        true
    } else if let Some(n) = pulled.notebooks.iter_mut().find(|n| n.uuid() == uuid) {
        n.cancel()?;
        true
    } else if let Some(c) = pulled.compute_clusters.iter_mut().find(|c| c.uuid() == uuid) {
        c.cancel()?;
        true
    } else {
        false
    };
    let removed = cluster.remove(uuid)?;
    match (cancelled, removed) {
        (true, _) => Ok(format!("Cancelled {}", uuid)),
        (false, true) => Ok(format!("Removed stale entry {}", uuid)),
        (false, false) => Err(RigError::Validation(format!("no deployment {}", uuid))),
    }
}

pub fn clear(config_path: &Path, name: Option<&str>) -> Result<String> {
    let cluster = connect(config_path, name)?;
    cluster.clear()?;
    Ok("Cleared deployment document".into())
}

pub fn check(config_path: &Path, name: Option<&str>) -> Result<String> {
    let cluster = connect(config_path, name)?;
    cluster.check_connection()?;
    Ok(format!("{} is reachable", cluster.config().user_at_host()))
}
