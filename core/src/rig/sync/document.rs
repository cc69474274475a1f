//! The shared deployments document and its lease rules.
//!
//! The document lives on the access node and maps every pushed deployment's
//! uuid to its serialized form and a lease expiration. It is partitioned by
//! kind:
//!
//! ```json
//! {
//!   "allocations":      { "<uuid>": { "value": { ... }, "expiration_date": "..." } },
//!   "notebooks":        { ... },
//!   "compute_clusters": { ... }
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::recipes::compute_cluster::ComputeClusterSnapshot;
use crate::recipes::notebook::NotebookSnapshot;
use crate::rig::allocation::AllocationSnapshot;
use crate::rig::node::{NodeSnapshot, NodeState};

/// Entries expiring sooner than this are treated as already gone.
pub const LEASE_MARGIN_SECONDS: i64 = 30;

/// Lease given to deployments with no time-limited node.
pub const UNLIMITED_LEASE_DAYS: i64 = 1;


// ---------------------------------------------------------------------------
// DeploymentSnapshot
// ---------------------------------------------------------------------------

/// Serialized form of any deployment that can be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentSnapshot {
    Allocation(AllocationSnapshot),
    Notebook(NotebookSnapshot),
    ComputeCluster(ComputeClusterSnapshot),
}

impl DeploymentSnapshot {
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentSnapshot::Allocation(_) => "allocation",
            DeploymentSnapshot::Notebook(_) => "notebook",
            DeploymentSnapshot::ComputeCluster(_) => "compute_cluster",
        }
    }

    /// Every node the deployment runs on.
    pub fn nodes(&self) -> Vec<&NodeSnapshot> {
        match self {
            DeploymentSnapshot::Allocation(a) => a.nodes.iter().collect(),
            DeploymentSnapshot::Notebook(n) => vec![&n.deployment.node],
            DeploymentSnapshot::ComputeCluster(c) => std::iter::once(&c.scheduler.node)
                .chain(c.workers.iter().map(|w| &w.node))
                .collect(),
        }
    }

    /// Lease expiration: the earliest node deadline, or one day from `now`
    /// when no node is time limited.
    pub fn expiration(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.nodes()
            .into_iter()
            .filter_map(|node| match node.state {
                NodeState::Allocated { allocated_until, .. } => allocated_until,
                _ => None,
            })
            .min()
            .unwrap_or_else(|| now + Duration::days(UNLIMITED_LEASE_DAYS))
    }

    /// Whether any node is no longer usable at `now`.
    pub fn has_expired_node(&self, now: DateTime<Utc>) -> bool {
        self.nodes().into_iter().any(|node| match node.state {
            NodeState::Allocated { allocated_until, .. } => allocated_until.is_some_and(|until| until < now),
            NodeState::Unallocated | NodeState::Cancelled => true,
        })
    }
}


// ---------------------------------------------------------------------------
// DeploymentDefinitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDefinition<T> {
    pub value: T,
    pub expiration_date: DateTime<Utc>,
}

/// One entry of the document, whatever its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub uuid: Uuid,
    pub snapshot: DeploymentSnapshot,
    pub expiration_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentDefinitions {
    #[serde(default)]
    pub allocations: BTreeMap<Uuid, DeploymentDefinition<AllocationSnapshot>>,
    #[serde(default)]
    pub notebooks: BTreeMap<Uuid, DeploymentDefinition<NotebookSnapshot>>,
    #[serde(default)]
    pub compute_clusters: BTreeMap<Uuid, DeploymentDefinition<ComputeClusterSnapshot>>,
}

impl DeploymentDefinitions {
    /// Parse the document. Empty text is an empty document.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(DeploymentDefinitions::default());
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn len(&self) -> usize {
        self.allocations.len() + self.notebooks.len() + self.compute_clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `snapshot` under `uuid` in its partition. Returns true if an entry
    /// with that uuid was replaced, in any partition.
    pub fn insert(&mut self, uuid: Uuid, snapshot: DeploymentSnapshot, expiration_date: DateTime<Utc>) -> bool {
        let replaced = self.remove(&uuid);
        match snapshot {
            DeploymentSnapshot::Allocation(value) => {
                self.allocations.insert(uuid, DeploymentDefinition { value, expiration_date });
            }
            DeploymentSnapshot::Notebook(value) => {
                self.notebooks.insert(uuid, DeploymentDefinition { value, expiration_date });
            }
            DeploymentSnapshot::ComputeCluster(value) => {
                self.compute_clusters
                    .insert(uuid, DeploymentDefinition { value, expiration_date });
            }
        }
        replaced
    }

    pub fn remove(&mut self, uuid: &Uuid) -> bool {
        let a = self.allocations.remove(uuid).is_some();
        let n = self.notebooks.remove(uuid).is_some();
        let c = self.compute_clusters.remove(uuid).is_some();
        a || n || c
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Entry> {
        self.entries().into_iter().find(|e| e.uuid == *uuid)
    }

    /// Drop every entry whose lease ends before `now` plus the margin.
    /// Returns how many were dropped.
    pub fn retain_leases(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now + Duration::seconds(LEASE_MARGIN_SECONDS);
        let before = self.len();
        self.allocations.retain(|_, d| d.expiration_date >= cutoff);
        self.notebooks.retain(|_, d| d.expiration_date >= cutoff);
        self.compute_clusters.retain(|_, d| d.expiration_date >= cutoff);
        before - self.len()
    }

    /// All entries, soonest expiration first.
    pub fn entries(&self) -> Vec<Entry> {
        let allocations = self.allocations.iter().map(|(uuid, d)| Entry {
            uuid: *uuid,
            snapshot: DeploymentSnapshot::Allocation(d.value.clone()),
            expiration_date: d.expiration_date,
        });
        let notebooks = self.notebooks.iter().map(|(uuid, d)| Entry {
            uuid: *uuid,
            snapshot: DeploymentSnapshot::Notebook(d.value.clone()),
            expiration_date: d.expiration_date,
        });
        let clusters = self.compute_clusters.iter().map(|(uuid, d)| Entry {
            uuid: *uuid,
            snapshot: DeploymentSnapshot::ComputeCluster(d.value.clone()),
            expiration_date: d.expiration_date,
        });
        let mut entries: Vec<Entry> = allocations.chain(notebooks).chain(clusters).collect();
        entries.sort_by_key(|e| e.expiration_date);
        entries
    }
}
