//! Deployment synchronization through a shared document on the access node.
//!
//! `push` records a deployment under a lease that ends when its first node's
//! allocation does. `pull` reads the document back from any client process,
//! drops what is expired or no longer running, and rebinds the rest to the
//! caller's cluster context.

pub mod document;

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::recipes::compute_cluster::ComputeClusterDeployment;
use crate::recipes::notebook::NotebookDeployment;
use crate::rig::allocation::Allocation;
use crate::rig::config::ClusterConfig;
use crate::rig::node::NodeHandle;
use crate::shell;

pub use document::{DeploymentDefinitions, DeploymentSnapshot, Entry};

pub fn document_path(config: &ClusterConfig) -> String {
    config.rig_path("deployments.json")
}

fn download(access: &NodeHandle) -> Result<DeploymentDefinitions> {
    let path = document_path(access.context().config());
    let text = access.run(&format!("cat {} 2>/dev/null || true", shell::quote(&path)))?;
    DeploymentDefinitions::parse(&text)
}

fn upload(access: &NodeHandle, definitions: &DeploymentDefinitions) -> Result<()> {
    let path = document_path(access.context().config());
    access.write_file(&path, &definitions.to_json()?, None)
}

/// Record `snapshot` under `uuid`. Entries whose lease has run out are pruned
/// on the way.
pub fn push(access: &NodeHandle, uuid: Uuid, snapshot: DeploymentSnapshot) -> Result<()> {
    let now = access.context().now();
    let mut definitions = download(access)?;
    let pruned = definitions.retain_leases(now);
    if pruned > 0 {
        log::debug!("pruned {} expired deployment(s)", pruned);
    }
    let kind = snapshot.kind();
    let expiration = snapshot.expiration(now);
    if definitions.insert(uuid, snapshot, expiration) {
        log::warn!("deployment {} was already pushed; overwriting", uuid);
    }
    upload(access, &definitions)?;
    log::info!("pushed {} {} (lease until {})", kind, uuid, expiration);
    Ok(())
}

/// Deployments recovered by `pull`, each list soonest expiration first.
#[derive(Debug, Default)]
pub struct SynchronizedDeployments {
    pub allocations: Vec<Allocation>,
    pub notebooks: Vec<NotebookDeployment>,
    pub compute_clusters: Vec<ComputeClusterDeployment>,
}

impl SynchronizedDeployments {
    pub fn len(&self) -> usize {
        self.allocations.len() + self.notebooks.len() + self.compute_clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every live deployment in the document, bound to the context of `access`.
///
/// Allocations are kept only while their job is running; polling errors are
/// returned. Notebooks and compute clusters are dropped when any of their
/// nodes has expired, or with a warning when they cannot be reattached.
pub fn pull(access: &Arc<NodeHandle>) -> Result<SynchronizedDeployments> {
    let ctx = access.context().clone();
    let now = ctx.now();
    let mut definitions = download(access)?;
    let dropped = definitions.retain_leases(now);
    if dropped > 0 {
        log::debug!("{} deployment lease(s) expired", dropped);
    }

    let mut pulled = SynchronizedDeployments::default();
    for entry in definitions.entries() {
        let uuid = entry.uuid;
        if !matches!(entry.snapshot, DeploymentSnapshot::Allocation(_)) && entry.snapshot.has_expired_node(now) {
            log::debug!("{} {} has an expired node, skipping", entry.snapshot.kind(), uuid);
            continue;
        }
        match entry.snapshot {
            DeploymentSnapshot::Allocation(snapshot) => {
                let allocation = Allocation::from_snapshot(access, uuid, &snapshot);
                if allocation.running()? {
                    pulled.allocations.push(allocation);
                } else {
                    log::debug!("allocation {} (job {}) is not running", uuid, snapshot.job_id);
                }
            }
            DeploymentSnapshot::Notebook(snapshot) => match NotebookDeployment::from_snapshot(&ctx, uuid, &snapshot) {
                Ok(notebook) => pulled.notebooks.push(notebook),
                Err(e) => log::warn!("could not reattach notebook {}: {}", uuid, e),
            },
            DeploymentSnapshot::ComputeCluster(snapshot) => {
                match ComputeClusterDeployment::from_snapshot(&ctx, uuid, &snapshot) {
                    Ok(cluster) => pulled.compute_clusters.push(cluster),
                    Err(e) => log::warn!("could not reattach compute cluster {}: {}", uuid, e),
                }
            }
        }
    }
    log::info!("pulled {} deployment(s)", pulled.len());
    Ok(pulled)
}

/// Lease-filtered document entries, without contacting their nodes.
pub fn entries(access: &NodeHandle) -> Result<Vec<Entry>> {
    let mut definitions = download(access)?;
    definitions.retain_leases(access.context().now());
    Ok(definitions.entries())
}

/// Delete the document.
pub fn clear(access: &NodeHandle) -> Result<()> {
    let path = document_path(access.context().config());
    access.run(&format!("rm -f {}", shell::quote(&path)))?;
    log::info!("cleared deployment document");
    Ok(())
}

/// Drop one entry. Returns whether it was present.
pub fn remove(access: &NodeHandle, uuid: Uuid) -> Result<bool> {
    let mut definitions = download(access)?;
    if !definitions.remove(&uuid) {
        return Ok(false);
    }
    upload(access, &definitions)?;
    log::info!("removed deployment {}", uuid);
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RigError;
    use crate::recipes::notebook::deploy_notebook;
    use crate::rig::allocation::request::{AllocationParameters, Bytes, Timeout};
    use crate::rig::allocation;
    use crate::testing::Harness;
    use std::time::Duration;

    fn running_allocation(h: &Harness) -> Allocation {
        let params = AllocationParameters {
            nodes: Some(1),
            cores: Some(2),
            memory_per_node: Some(Bytes::gib(1)),
            walltime: Some("1:00:00".parse().unwrap()),
            native_args: Default::default(),
        };
        let mut alloc = allocation::request(&h.access, &params).unwrap();
        alloc.wait(Timeout::Never).unwrap();
        alloc
    }

    fn push_allocation(h: &Harness, alloc: &Allocation) {
        push(&h.access, alloc.uuid(), DeploymentSnapshot::Allocation(alloc.snapshot())).unwrap();
    }

    #[test]
    fn missing_document_pulls_nothing() {
        let h = Harness::new();
        assert!(pull(&h.access).unwrap().is_empty());
        assert!(entries(&h.access).unwrap().is_empty());
    }

    #[test]
    fn pushed_allocation_is_pulled_back() {
        let h = Harness::new();
        let alloc = running_allocation(&h);
        push_allocation(&h, &alloc);

        let stored = h.fake.file(".rig/deployments.json").unwrap();
        let doc = DeploymentDefinitions::parse(&stored).unwrap();
        let entry = doc.get(&alloc.uuid()).unwrap();
        assert_eq!(entry.expiration_date, alloc.earliest_allocated_until().unwrap());

        let pulled = pull(&h.access).unwrap();
        assert_eq!(pulled.allocations.len(), 1);
        assert_eq!(pulled.allocations[0].uuid(), alloc.uuid());
        assert_eq!(pulled.allocations[0].nodes()[0].host(), alloc.nodes()[0].host());
    }

    #[test]
    fn pull_orders_by_expiration() {
        let h = Harness::new();
        let mut pushed = Vec::new();
        for time_left in ["1-06:00:00", "10:00:00", "20:00:00"] {
            h.fake.set_time_left(time_left);
            let alloc = running_allocation(&h);
            push_allocation(&h, &alloc);
            pushed.push(alloc.uuid());
        }
        let pulled: Vec<Uuid> = pull(&h.access).unwrap().allocations.iter().map(|a| a.uuid()).collect();
        assert_eq!(pulled, vec![pushed[1], pushed[2], pushed[0]]);
    }

    #[test]
    fn push_overwrites_same_uuid() {
        let h = Harness::new();
        let alloc = running_allocation(&h);
        push_allocation(&h, &alloc);
        push_allocation(&h, &alloc);
        assert_eq!(entries(&h.access).unwrap().len(), 1);
    }

    #[test]
    fn expiring_lease_is_dropped() {
        let h = Harness::new();
        let alloc = running_allocation(&h);
        push_allocation(&h, &alloc);
        // one hour walltime; 29 seconds before the end the lease is gone
        h.clock.advance(Duration::from_secs(3600 - 29));
        assert!(pull(&h.access).unwrap().is_empty());
        assert!(!h.commands().last().unwrap().starts_with("squeue"));
    }

    #[test]
    fn finished_job_is_dropped() {
        let h = Harness::new();
        let mut alloc = running_allocation(&h);
        push_allocation(&h, &alloc);
        alloc.cancel().unwrap();
        assert!(pull(&h.access).unwrap().allocations.is_empty());
    }

    #[test]
    fn poll_errors_propagate() {
        let h = Harness::new();
        let alloc = running_allocation(&h);
        push_allocation(&h, &alloc);
        h.fake.fail_next("squeue", 1, "connection closed");
        assert!(matches!(pull(&h.access), Err(RigError::Remote { .. })));
    }

    #[test]
    fn notebook_is_reattached_on_a_new_port() {
        let h = Harness::new();
        h.fake.on_script("jupyter", "RIG_NOTEBOOK_PORT=8899\n");
        let node = h.compute_node("nid001", 40001);
        let notebook = deploy_notebook(&node, 9000).unwrap();
        push(&h.access, notebook.uuid(), DeploymentSnapshot::Notebook(notebook.snapshot())).unwrap();

        let pulled = pull(&h.access).unwrap();
        assert_eq!(pulled.notebooks.len(), 1);
        assert_eq!(pulled.notebooks[0].uuid(), notebook.uuid());
        assert_eq!(pulled.notebooks[0].remote_port(), 8899);
        assert_eq!(pulled.notebooks[0].local_port(), Some(40000));
    }

    #[test]
    fn unreachable_notebook_is_dropped_with_warning() {
        let h = Harness::with_config(|c| {
            c.retries
                .set(crate::rig::retry::RetryName::TunnelOpen, crate::rig::retry::RetryPolicy::new(0, 0))
        });
        h.fake.on_script("jupyter", "RIG_NOTEBOOK_PORT=8899\n");
        let node = h.compute_node("nid001", 40001);
        let notebook = deploy_notebook(&node, 9000).unwrap();
        push(&h.access, notebook.uuid(), DeploymentSnapshot::Notebook(notebook.snapshot())).unwrap();
        // the notebook's own tunnel was open call 0
        h.launcher.fail_open(1);
        assert!(pull(&h.access).unwrap().notebooks.is_empty());
    }

    #[test]
    fn remove_and_clear() {
        let h = Harness::new();
        let alloc = running_allocation(&h);
        push_allocation(&h, &alloc);
        assert!(remove(&h.access, alloc.uuid()).unwrap());
        assert!(!remove(&h.access, alloc.uuid()).unwrap());
        assert!(entries(&h.access).unwrap().is_empty());

        push_allocation(&h, &alloc);
        clear(&h.access).unwrap();
        assert!(h.fake.file(".rig/deployments.json").is_none());
        assert!(pull(&h.access).unwrap().is_empty());
    }
}
