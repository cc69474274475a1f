//! Dask-style compute cluster: one scheduler plus a worker on every node.
//!
//! The scheduler runs on the first node and reports its address in its log.
//! Workers start in parallel through the worker pool and count as started once
//! they log their registration. A worker that never registers is cancelled and
//! started again on another node, up to `max_redeploy_attempts` times.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RigError};
use crate::recipes::notebook::free_port_line;
use crate::rig::allocation::request::Bytes;
use crate::rig::context::ClusterContext;
use crate::rig::deployment::{deploy, Deployment, DeploymentScript, GenericDeploymentSnapshot};
use crate::rig::node::NodeHandle;
use crate::rig::pool;
use crate::rig::retry::RetryName;
use crate::shell;

pub const SCHEDULER_MARKER: &str = "Scheduler at:";
pub const DASHBOARD_MARKER: &str = "RIG_DASHBOARD_PORT=";
pub const REGISTERED_MARKER: &str = "Registered to:";


// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

pub fn scheduler_script(setup: &[String], host: &str) -> String {
    DeploymentScript::new()
        .setup(setup.iter().cloned())
        .command(free_port_line("PORT"))
        .command(free_port_line("DASHBOARD_PORT"))
        .command(format!("echo \"{}$DASHBOARD_PORT\"", DASHBOARD_MARKER))
        .command(format!(
            "dask-scheduler --host {} --port \"$PORT\" --dashboard-address \":$DASHBOARD_PORT\"",
            shell::quote(host)
        ))
        .render()
}

pub fn worker_script(setup: &[String], address: &str, cores: u32, memory: Bytes) -> String {
    DeploymentScript::new()
        .setup(setup.iter().cloned())
        .command(format!(
            "dask-worker {} --nthreads {} --memory-limit {}",
            shell::quote(address),
            cores,
            memory.as_u64()
        ))
        .render()
}

/// Scheduler address (`tcp://host:port`) from the scheduler's log.
pub fn parse_scheduler_address(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(SCHEDULER_MARKER)?;
        let address = rest.trim();
        (!address.is_empty()).then(|| address.to_string())
    })
}

pub fn parse_dashboard_port(output: &str) -> Option<u16> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(DASHBOARD_MARKER))
        .and_then(|port| port.trim().parse().ok())
}

fn scheduler_endpoints(output: &str) -> Option<(String, u16)> {
    Some((parse_scheduler_address(output)?, parse_dashboard_port(output)?))
}


// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeClusterSnapshot {
    pub scheduler: GenericDeploymentSnapshot,
    pub workers: Vec<GenericDeploymentSnapshot>,
    pub scheduler_address: String,
    pub dashboard_port: u16,
}


// ---------------------------------------------------------------------------
// ComputeClusterDeployment
// ---------------------------------------------------------------------------

pub struct ComputeClusterDeployment {
    uuid: Uuid,
    scheduler: Deployment,
    workers: Vec<Deployment>,
    scheduler_address: String,
    dashboard_port: u16,
}

/// Start a scheduler on the first of `nodes` and a worker on each of them,
/// then tunnel the dashboard to `local_dashboard_port` (0 for any).
///
/// On failure everything already started is cancelled again.
pub fn deploy_compute_cluster(
    nodes: &[Arc<NodeHandle>],
    local_dashboard_port: u16,
) -> Result<ComputeClusterDeployment> {
    let first = nodes
        .first()
        .ok_or_else(|| RigError::Validation("a compute cluster needs at least one node".into()))?;
    let ctx = first.context().clone();
    let host = first
        .host()
        .ok_or_else(|| RigError::StateMismatch("scheduler node is not allocated".into()))?;

    let script = scheduler_script(&ctx.config().setup_actions.compute_cluster, &host);
    let mut scheduler = deploy(first, &script)?;
    match start(&ctx, &mut scheduler, nodes, local_dashboard_port) {
        Ok((scheduler_address, dashboard_port, workers)) => {
            let cluster = ComputeClusterDeployment {
                uuid: Uuid::new_v4(),
                scheduler,
                workers,
                scheduler_address,
                dashboard_port,
            };
            log::info!(
                "compute cluster {} up: scheduler {}, {} worker(s), dashboard {}",
                cluster.uuid,
                cluster.scheduler_address,
                cluster.workers.len(),
                cluster.dashboard_url()
            );
            Ok(cluster)
        }
        Err(e) => {
            if let Err(cancel_err) = scheduler.cancel() {
                log::warn!("cancelling scheduler after failed start: {}", cancel_err);
            }
            Err(e)
        }
    }
}

fn start(
    ctx: &ClusterContext,
    scheduler: &mut Deployment,
    nodes: &[Arc<NodeHandle>],
    local_dashboard_port: u16,
) -> Result<(String, u16, Vec<Deployment>)> {
    let (address, dashboard_port) = discover_scheduler(ctx, scheduler)?;
    let workers = start_workers(ctx, nodes, &address)?;
    match scheduler
        .node()
        .tunnel_with_fallback(dashboard_port, local_dashboard_port)
    {
        Ok(tunnel) => scheduler.add_tunnel(tunnel),
        Err(e) => {
            abandon_workers(ctx, workers);
            return Err(e);
        }
    }
    Ok((address, dashboard_port, workers))
}

fn discover_scheduler(ctx: &ClusterContext, scheduler: &Deployment) -> Result<(String, u16)> {
    if let Some(endpoints) = scheduler_endpoints(scheduler.output()) {
        return Ok(endpoints);
    }
    let host = scheduler.node().host().unwrap_or_default();
    ctx.retry(RetryName::SchedulerConnect, || {
        let output = scheduler.read_output()?;
        scheduler_endpoints(&output)
            .ok_or_else(|| RigError::remote(&host, "scheduler has not reported its address yet"))
    })
}

fn start_workers(ctx: &ClusterContext, nodes: &[Arc<NodeHandle>], address: &str) -> Result<Vec<Deployment>> {
    let setup = ctx.config().setup_actions.compute_cluster.clone();
    let results = pool::run_bounded(nodes.to_vec(), ctx.config().max_workers, |_, node| {
        start_worker(&node, &setup, address)
    });

    let mut workers = Vec::with_capacity(nodes.len());
    let mut failed = Vec::new();
    for (node, result) in nodes.iter().zip(results) {
        match result {
            Some(Ok(worker)) => workers.push(worker),
            Some(Err(e)) => {
                log::warn!("worker on {} failed to start: {}", node, e);
                failed.push(node.clone());
            }
            None => failed.push(node.clone()),
        }
    }

    for node in failed {
        match redeploy(ctx, &node, nodes, &setup, address) {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                abandon_workers(ctx, workers);
                return Err(e);
            }
        }
    }
    Ok(workers)
}

/// Start a replacement for the worker that failed on `failed`, on the other
/// nodes in turn.
fn redeploy(
    ctx: &ClusterContext,
    failed: &Arc<NodeHandle>,
    nodes: &[Arc<NodeHandle>],
    setup: &[String],
    address: &str,
) -> Result<Deployment> {
    let attempts = ctx.config().max_redeploy_attempts as usize;
    let others: Vec<&Arc<NodeHandle>> = nodes.iter().filter(|n| !Arc::ptr_eq(n, failed)).collect();
    let mut last = RigError::StateMismatch(format!(
        "worker on {} failed and could not be redeployed",
        failed
    ));
    for (attempt, node) in others.iter().cycle().take(attempts).enumerate() {
        log::info!(
            "redeploying worker from {} on {} (attempt {}/{})",
            failed,
            node,
            attempt + 1,
            attempts
        );
        match start_worker(node, setup, address) {
            Ok(worker) => return Ok(worker),
            Err(e) => last = e,
        }
    }
    Err(last)
}

fn start_worker(node: &Arc<NodeHandle>, setup: &[String], address: &str) -> Result<Deployment> {
    let script = worker_script(setup, address, node.cores(), node.memory());
    let mut worker = deploy(node, &script)?;
    if let Err(e) = wait_registered(&worker) {
        if let Err(cancel_err) = worker.cancel() {
            log::warn!("cancelling unregistered worker on {}: {}", node, cancel_err);
        }
        return Err(e);
    }
    Ok(worker)
}

fn wait_registered(worker: &Deployment) -> Result<()> {
    if worker.output().contains(REGISTERED_MARKER) {
        return Ok(());
    }
    let ctx = worker.node().context().clone();
    let host = worker.node().host().unwrap_or_default();
    ctx.retry(RetryName::CheckWorkerStarted, || {
        if worker.read_output()?.contains(REGISTERED_MARKER) {
            Ok(())
        } else {
            Err(RigError::remote(&host, "worker has not registered with the scheduler yet"))
        }
    })
}

/// Cancel `workers` in parallel. Returns the ones that could not be cancelled
/// and the first error.
fn cancel_workers(max_workers: usize, workers: Vec<Deployment>) -> (Vec<Deployment>, Option<RigError>) {
    let results = pool::run_bounded(workers, max_workers, |_, mut worker| {
        let result = worker.cancel();
        (worker, result)
    });
    let mut remaining = Vec::new();
    let mut first_error = None;
    for (worker, result) in results.into_iter().flatten() {
        if let Err(e) = result {
            log::warn!("cancelling worker {} failed: {}", worker.uuid(), e);
            first_error.get_or_insert(e);
            remaining.push(worker);
        }
    }
    (remaining, first_error)
}

/// Cancel the workers of a cluster that failed to start.
fn abandon_workers(ctx: &ClusterContext, workers: Vec<Deployment>) {
    let (remaining, error) = cancel_workers(ctx.config().max_workers, workers);
    if let Some(e) = error {
        log::error!(
            "{} worker(s) of a failed compute cluster are still running: {}",
            remaining.len(),
            e
        );
    }
}

impl ComputeClusterDeployment {
    /// Rebind a serialized cluster to `ctx`; the dashboard tunnel is opened
    /// again on any free local port.
    pub fn from_snapshot(ctx: &Arc<ClusterContext>, uuid: Uuid, snapshot: &ComputeClusterSnapshot) -> Result<Self> {
        let mut scheduler = Deployment::from_snapshot(ctx, &snapshot.scheduler);
        let tunnel = scheduler.node().tunnel_with_fallback(snapshot.dashboard_port, 0)?;
        scheduler.add_tunnel(tunnel);
        Ok(ComputeClusterDeployment {
            uuid,
            scheduler,
            workers: snapshot
                .workers
                .iter()
                .map(|w| Deployment::from_snapshot(ctx, w))
                .collect(),
            scheduler_address: snapshot.scheduler_address.clone(),
            dashboard_port: snapshot.dashboard_port,
        })
    }

    pub fn snapshot(&self) -> ComputeClusterSnapshot {
        ComputeClusterSnapshot {
            scheduler: self.scheduler.snapshot(),
            workers: self.workers.iter().map(Deployment::snapshot).collect(),
            scheduler_address: self.scheduler_address.clone(),
            dashboard_port: self.dashboard_port,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn scheduler(&self) -> &Deployment {
        &self.scheduler
    }

    pub fn workers(&self) -> &[Deployment] {
        &self.workers
    }

    /// Address clients connect to, as reported by the scheduler.
    pub fn scheduler_address(&self) -> &str {
        &self.scheduler_address
    }

    pub fn dashboard_port(&self) -> u16 {
        self.dashboard_port
    }

    pub fn local_dashboard_port(&self) -> Option<u16> {
        self.scheduler.tunnels().first().map(|t| t.here())
    }

    pub fn dashboard_url(&self) -> String {
        format!("http://localhost:{}/status", self.local_dashboard_port().unwrap_or(0))
    }

    /// Tear down the workers in parallel, then the scheduler and its tunnel.
    /// Workers that fail to stop stay attached so a later call retries them.
    pub fn cancel(&mut self) -> Result<()> {
        let max_workers = self.scheduler.node().context().config().max_workers;
        let workers = std::mem::take(&mut self.workers);
        let (remaining, mut first_error) = cancel_workers(max_workers, workers);
        self.workers = remaining;
        if let Err(e) = self.scheduler.cancel() {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("compute cluster {} cancelled", self.uuid);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ComputeClusterDeployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeClusterDeployment")
            .field("uuid", &self.uuid)
            .field("scheduler_address", &self.scheduler_address)
            .field("workers", &self.workers.len())
            .field("dashboard_port", &self.dashboard_port)
            .finish()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
