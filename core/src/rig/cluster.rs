//! Cluster facade: one connected cluster and the operations on it.
//!
//! `Cluster` owns the shared `ClusterContext` (config, remote channel,
//! forwarder launcher, clock) and the access node handle. Everything with a
//! side effect on the cluster goes through the injected channel and launcher,
//! so tests substitute `MockChannel` and `MockLauncher`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, RigError};
use crate::recipes::compute_cluster::{self, ComputeClusterDeployment};
use crate::recipes::notebook::{self, NotebookDeployment};
use crate::rig::allocation::request::AllocationParameters;
use crate::rig::allocation::{self, Allocation};
use crate::rig::config::ClusterConfig;
use crate::rig::context::ClusterContext;
use crate::rig::deployment::{self, Deployment};
use crate::rig::node::NodeHandle;
use crate::rig::remote::{RemoteChannel, SshChannel};
use crate::rig::sync::{self, DeploymentSnapshot, Entry, SynchronizedDeployments};
use crate::rig::tunnel::{ForwarderLauncher, SshForwarderLauncher};

/// How long a freshly spawned forwarder may take to accept connections.
const FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(15);

pub struct Cluster {
    ctx: Arc<ClusterContext>,
    access: Arc<NodeHandle>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.ctx.config().name)
            .field("access", &self.ctx.config().user_at_host())
            .finish()
    }
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        channel: Arc<dyn RemoteChannel>,
        launcher: Arc<dyn ForwarderLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(ClusterContext::new(config, channel, launcher, clock));
        let access = NodeHandle::access(ctx.clone());
        Ok(Cluster { ctx, access })
    }

    /// Production wiring: the system `ssh` binary, `ssh -N -L` forwarders and
    /// the wall clock.
    pub fn connect(config: ClusterConfig) -> Result<Self> {
        log::debug!("connecting to cluster '{}' ({})", config.name, config.user_at_host());
        Cluster::new(
            config,
            Arc::new(SshChannel),
            Arc::new(SshForwarderLauncher::new(FORWARD_READY_TIMEOUT)),
            Arc::new(SystemClock),
        )
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn config(&self) -> &ClusterConfig {
        self.ctx.config()
    }

    pub fn access_node(&self) -> &Arc<NodeHandle> {
        &self.access
    }

    /// Run `echo ok` on the access node.
    pub fn check_connection(&self) -> Result<()> {
        let output = self.access.run("echo ok")?;
        if output.trim() == "ok" {
            log::info!("cluster '{}' reachable", self.config().name);
            Ok(())
        } else {
            Err(RigError::remote(
                &self.config().host,
                format!("unexpected response to connection check: '{}'", output.trim()),
            ))
        }
    }

    // -- Allocations and deployments --

    /// Submit a job; call `wait` on the result to get usable nodes.
    pub fn allocate(&self, params: &AllocationParameters) -> Result<Allocation> {
        allocation::request(&self.access, params)
    }

    pub fn deploy(&self, node: &Arc<NodeHandle>, script: &str) -> Result<Deployment> {
        deployment::deploy(node, script)
    }

    pub fn deploy_notebook(&self, node: &Arc<NodeHandle>, local_port: u16) -> Result<NotebookDeployment> {
        notebook::deploy_notebook(node, local_port)
    }

    pub fn deploy_compute_cluster(
        &self,
        nodes: &[Arc<NodeHandle>],
        local_dashboard_port: u16,
    ) -> Result<ComputeClusterDeployment> {
        compute_cluster::deploy_compute_cluster(nodes, local_dashboard_port)
    }

    // -- Synchronization --

    pub fn push(&self, uuid: Uuid, snapshot: DeploymentSnapshot) -> Result<()> {
        sync::push(&self.access, uuid, snapshot)
    }

    pub fn pull(&self) -> Result<SynchronizedDeployments> {
        sync::pull(&self.access)
    }

    /// Document entries without reattaching them.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        sync::entries(&self.access)
    }

    pub fn clear(&self) -> Result<()> {
        sync::clear(&self.access)
    }

    pub fn remove(&self, uuid: Uuid) -> Result<bool> {
        sync::remove(&self.access, uuid)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::allocation::request::{Bytes, Timeout};
    use crate::testing::Harness;

    fn cluster(h: &Harness) -> Cluster {
        Cluster::new(
            h.ctx.config().clone(),
            h.channel.clone(),
            Arc::new(h.launcher.clone()),
            h.clock.clone(),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let h = Harness::new();
        let mut config = h.ctx.config().clone();
        config.host.clear();
        let result = Cluster::new(config, h.channel.clone(), Arc::new(h.launcher.clone()), h.clock.clone());
        assert!(matches!(result, Err(RigError::Config(_))));
    }

    #[test]
    fn connection_check() {
        let h = Harness::new();
        cluster(&h).check_connection().unwrap();
        assert_eq!(h.commands(), vec!["echo ok"]);

        h.fake.fail_next("echo", 1, "Permission denied (publickey)");
        assert!(cluster(&h).check_connection().is_err());
    }

    #[test]
    fn allocate_push_pull_remove() {
        let h = Harness::new();
        let cluster = cluster(&h);
        let params = AllocationParameters {
            nodes: Some(2),
            cores: Some(8),
            memory_per_node: Some(Bytes::gib(4)),
            walltime: Some("2:00:00".parse().unwrap()),
            native_args: Default::default(),
        };
        let mut alloc = cluster.allocate(&params).unwrap();
        alloc.wait(Timeout::Never).unwrap();
        cluster
            .push(alloc.uuid(), DeploymentSnapshot::Allocation(alloc.snapshot()))
            .unwrap();

        let pulled = cluster.pull().unwrap();
        assert_eq!(pulled.allocations.len(), 1);
        assert_eq!(cluster.entries().unwrap()[0].uuid, alloc.uuid());

        assert!(cluster.remove(alloc.uuid()).unwrap());
        assert!(cluster.pull().unwrap().is_empty());
        cluster.clear().unwrap();
    }
}
