//! Allocation engine.
//!
//! `request` validates the parameters, writes the entry point to the access
//! node and submits the job. `Allocation::wait` polls the queue until the job
//! runs, then assigns hosts, deadlines and sshd ports to the node handles.
//! `cancel` releases the job; `running` asks the queue afresh.

pub mod discovery;
pub mod entry_point;
pub mod nodelist;
pub mod request;
pub mod slurm;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::to_chrono;
use crate::error::{Result, RigError};
use crate::rig::cleanup::CleanupStack;
use crate::rig::context::ClusterContext;
use crate::rig::node::{NodeHandle, NodeSnapshot};
use crate::rig::retry::RetryName;

use discovery::PortLookup;
use request::{AllocationParameters, AllocationRequest, Timeout};
use slurm::{JobState, JobStatus};


// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Requested,
    Pending,
    Configuring,
    Running,
    Cancelled,
}

/// Serialized form of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    pub job_id: u64,
    pub request: AllocationRequest,
    pub state: AllocationState,
    pub nodes: Vec<NodeSnapshot>,
}


// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

pub struct Allocation {
    uuid: Uuid,
    job_id: u64,
    request: AllocationRequest,
    access: Arc<NodeHandle>,
    nodes: Vec<Arc<NodeHandle>>,
    entry_point: Option<String>,
    state: AllocationState,
}

/// Validate `params` and submit a job for them through `access`.
///
/// Nothing touches the cluster when validation fails. If submission fails the
/// entry point is removed again.
pub fn request(access: &Arc<NodeHandle>, params: &AllocationParameters) -> Result<Allocation> {
    let request = AllocationRequest::new(params)?;
    let ctx = access.context().clone();
    let config = ctx.config();
    let uuid = Uuid::new_v4();

    let entry_point = entry_point::entry_point_path(&config.rig_dir, &uuid);
    let script = entry_point::render(&config.rig_dir, config.node_sshd);
    access.write_file(&entry_point, &script, Some("700"))?;

    let mut stack = CleanupStack::new();
    {
        let access = access.clone();
        let path = entry_point.clone();
        stack.push("remove entry point", move || {
            access.remove_file_best_effort(&path);
            Ok(())
        });
    }
    let output = access.run(&slurm::sbatch_command(&request, &entry_point))?;
    let job_id = slurm::parse_job_id(&output)?;
    stack.dismiss();

    let (node_count, cores) = (request.effective_nodes(), request.effective_cores());
    log::info!(
        "submitted job {} for allocation {} ({} x {} cores, {})",
        job_id,
        uuid,
        node_count,
        cores,
        request.memory_per_node
    );
    let nodes = (0..node_count)
        .map(|_| NodeHandle::unallocated(ctx.clone(), cores, request.memory_per_node))
        .collect();
    Ok(Allocation {
        uuid,
        job_id,
        request,
        access: access.clone(),
        nodes,
        entry_point: Some(entry_point),
        state: AllocationState::Requested,
    })
}

fn poll(access: &NodeHandle, job_id: u64) -> Result<Option<JobStatus>> {
    let output = access.run(&slurm::squeue_command(job_id))?;
    Ok(slurm::find_status(&output, job_id))
}

impl Allocation {
    /// Rebind a serialized allocation to the context of `access`.
    pub fn from_snapshot(access: &Arc<NodeHandle>, uuid: Uuid, snapshot: &AllocationSnapshot) -> Allocation {
        let ctx = access.context();
        Allocation {
            uuid,
            job_id: snapshot.job_id,
            request: snapshot.request.clone(),
            access: access.clone(),
            nodes: snapshot
                .nodes
                .iter()
                .map(|n| NodeHandle::from_snapshot(ctx.clone(), n))
                .collect(),
            entry_point: None,
            state: snapshot.state,
        }
    }

    pub fn snapshot(&self) -> AllocationSnapshot {
        AllocationSnapshot {
            job_id: self.job_id,
            request: self.request.clone(),
            state: self.state,
            nodes: self.nodes.iter().map(|n| n.snapshot()).collect(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn request(&self) -> &AllocationRequest {
        &self.request
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn access(&self) -> &Arc<NodeHandle> {
        &self.access
    }

    pub fn nodes(&self) -> &[Arc<NodeHandle>] {
        &self.nodes
    }

    /// Latest end among the nodes; `None` when none is limited.
    pub fn allocated_until(&self) -> Option<DateTime<Utc>> {
        self.nodes.iter().filter_map(|n| n.allocated_until()).max()
    }

    /// Earliest end among the nodes; used as the lease of a pushed snapshot.
    pub fn earliest_allocated_until(&self) -> Option<DateTime<Utc>> {
        self.nodes.iter().filter_map(|n| n.allocated_until()).min()
    }

    pub fn is_expired(&self) -> bool {
        match self.allocated_until() {
            Some(until) => self.access.context().now() > until,
            None => false,
        }
    }

    /// Block until the job runs and every node is assigned.
    pub fn wait(&mut self, timeout: Timeout) -> Result<()> {
        match self.state {
            AllocationState::Cancelled => {
                return Err(RigError::StateMismatch(format!(
                    "allocation {} was cancelled",
                    self.uuid
                )))
            }
            AllocationState::Running => return Ok(()),
            _ => {}
        }
        let ctx = self.access.context().clone();
        let deadline = timeout.deadline(ctx.now());
        let status = self.wait_until_running(&ctx, deadline)?;

        let mut stack = CleanupStack::new();
        if let Some(path) = self.entry_point.take() {
            let access = self.access.clone();
            stack.push("remove entry point", move || {
                access.remove_file_best_effort(&path);
                Ok(())
            });
        }
        let assigned = self.assign_nodes(&ctx, &status);
        stack.unwind();
        assigned?;

        self.state = AllocationState::Running;
        log::info!(
            "allocation {} running on {}",
            self.uuid,
            self.nodes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    fn wait_until_running(&mut self, ctx: &ClusterContext, deadline: Option<DateTime<Utc>>) -> Result<JobStatus> {
        let job_id = self.job_id;
        let access = self.access.clone();
        let mut status = if self.state == AllocationState::Requested {
            ctx.retry(RetryName::JobStatusAfterSubmit, || {
                if let Some(status) = poll(&access, job_id)? {
                    return Ok(status);
                }
                if deadline.is_some_and(|d| ctx.now() >= d) {
                    return Err(RigError::Timeout(format!("job {} never showed up in the queue", job_id)));
                }
                Err(RigError::remote(&ctx.config().host, format!("job {} is not in the queue yet", job_id)))
            })?
        } else {
            poll(&access, job_id)?
                .ok_or_else(|| RigError::StateMismatch(format!("job {} is no longer queued", job_id)))?
        };

        let interval = Duration::from_secs(ctx.config().poll_interval_seconds);
        loop {
            match status.state {
                JobState::Running => return Ok(status),
                JobState::Pending => self.state = AllocationState::Pending,
                JobState::Configuring => self.state = AllocationState::Configuring,
                ref other => {
                    return Err(RigError::StateMismatch(format!(
                        "job {} is {} ({})",
                        job_id, other, status.reason
                    )))
                }
            }
            if let Some(deadline) = deadline {
                if ctx.now() >= deadline {
                    return Err(RigError::Timeout(format!(
                        "job {} still {} ({})",
                        job_id, status.state, status.reason
                    )));
                }
            }
            log::debug!("job {} is {} ({}), polling again", job_id, status.state, status.reason);
            ctx.sleep(interval);
            status = poll(&access, job_id)?
                .ok_or_else(|| RigError::StateMismatch(format!("job {} left the queue", job_id)))?;
        }
    }

    fn assign_nodes(&self, ctx: &ClusterContext, status: &JobStatus) -> Result<()> {
        if status.nodes.len() != self.nodes.len() {
            return Err(RigError::StateMismatch(format!(
                "job {} runs on {} node(s), expected {}",
                self.job_id,
                status.nodes.len(),
                self.nodes.len()
            )));
        }
        let allocated_until = status.time_left.map(|left| ctx.now() + to_chrono(left));
        let config = ctx.config();
        let mut lookup = if config.node_sshd {
            discovery::fetch(&self.access, self.job_id, self.nodes.len() as u32)?
        } else {
            PortLookup::default()
        };
        for (node, host) in self.nodes.iter().zip(&status.nodes) {
            let port = if config.node_sshd {
                lookup.resolve(host, config.default_node_port, config.strict_port_discovery)?
            } else {
                config.default_node_port
            };
            node.allocate(host, port, allocated_until)?;
        }
        Ok(())
    }

    /// Whether the job is running right now, according to a fresh poll.
    pub fn running(&self) -> Result<bool> {
        if self.state == AllocationState::Cancelled {
            return Ok(false);
        }
        let status = poll(&self.access, self.job_id)?;
        let running = matches!(status, Some(ref s) if s.state == JobState::Running);
        Ok(running && !self.is_expired())
    }

    /// Cancel the job. Nodes are marked cancelled even if `scancel` fails; its
    /// error is returned afterwards.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state == AllocationState::Cancelled {
            return Ok(());
        }
        let result = self.access.run(&slurm::scancel_command(self.job_id));
        for node in &self.nodes {
            node.cancel();
        }
        self.state = AllocationState::Cancelled;
        if let Some(path) = self.entry_point.take() {
            self.access.remove_file_best_effort(&path);
        }
        match result {
            Ok(_) => {
                log::info!("allocation {} (job {}) cancelled", self.uuid, self.job_id);
                Ok(())
            }
            Err(e) => {
                log::warn!("scancel {} failed: {}", self.job_id, e);
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("uuid", &self.uuid)
            .field("job_id", &self.job_id)
            .field("state", &self.state)
            .field("nodes", &self.nodes)
            .finish()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
