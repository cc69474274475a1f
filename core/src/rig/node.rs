//! Node handles.
//!
//! A `NodeHandle` is shared behind an `Arc`: an allocation owns its nodes, and
//! deployments and tunnels on them keep a reference. The handle's state moves
//! `Unallocated -> Allocated -> Cancelled`; commands and tunnels on a handle
//! that is not allocated, or whose allocation has expired, fail fast.
//!
//! The access node is a handle that is always allocated, without a time limit.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RigError};
use crate::rig::allocation::request::Bytes;
use crate::rig::context::ClusterContext;
use crate::rig::remote::SshTarget;
use crate::rig::retry::RetryName;
use crate::rig::tunnel::{self, Binding, Tunnel, LOOPBACK};
use crate::shell;


// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Unallocated,
    Allocated {
        host: String,
        port: u16,
        /// `None` means no time limit.
        allocated_until: Option<DateTime<Utc>>,
    },
    Cancelled,
}

/// Serialized form of a node handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    #[serde(default)]
    pub access: bool,
    pub cores: u32,
    pub memory: Bytes,
    pub state: NodeState,
}


// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

pub struct NodeHandle {
    ctx: Arc<ClusterContext>,
    access: bool,
    cores: u32,
    memory: Bytes,
    state: Mutex<NodeState>,
}

impl NodeHandle {
    /// Handle for the cluster's access node.
    pub fn access(ctx: Arc<ClusterContext>) -> Arc<NodeHandle> {
        let state = NodeState::Allocated {
            host: ctx.config().host.clone(),
            port: ctx.config().port,
            allocated_until: None,
        };
        Arc::new(NodeHandle {
            ctx,
            access: true,
            cores: 0,
            memory: Bytes(0),
            state: Mutex::new(state),
        })
    }

    /// A compute node not yet assigned by the workload manager.
    pub fn unallocated(ctx: Arc<ClusterContext>, cores: u32, memory: Bytes) -> Arc<NodeHandle> {
        Arc::new(NodeHandle {
            ctx,
            access: false,
            cores,
            memory,
            state: Mutex::new(NodeState::Unallocated),
        })
    }

    /// Rebind a serialized node to `ctx`. Access nodes take the context's
    /// current address.
    pub fn from_snapshot(ctx: Arc<ClusterContext>, snapshot: &NodeSnapshot) -> Arc<NodeHandle> {
        if snapshot.access {
            return NodeHandle::access(ctx);
        }
        Arc::new(NodeHandle {
            ctx,
            access: false,
            cores: snapshot.cores,
            memory: snapshot.memory,
            state: Mutex::new(snapshot.state.clone()),
        })
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            access: self.access,
            cores: self.cores,
            memory: self.memory,
            state: self.state(),
        }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub fn is_access(&self) -> bool {
        self.access
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn memory(&self) -> Bytes {
        self.memory
    }

    pub fn state(&self) -> NodeState {
        self.lock().clone()
    }

    pub fn host(&self) -> Option<String> {
        match *self.lock() {
            NodeState::Allocated { ref host, .. } => Some(host.clone()),
            _ => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match *self.lock() {
            NodeState::Allocated { port, .. } => Some(port),
            _ => None,
        }
    }

    /// End of the allocation; `None` when unlimited or not allocated.
    pub fn allocated_until(&self) -> Option<DateTime<Utc>> {
        match *self.lock() {
            NodeState::Allocated { allocated_until, .. } => allocated_until,
            _ => None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        matches!(*self.lock(), NodeState::Allocated { .. })
    }

    pub fn is_expired(&self) -> bool {
        match self.allocated_until() {
            Some(until) => self.ctx.now() > until,
            None => false,
        }
    }

    /// Record the workload manager's assignment.
    pub fn allocate(&self, host: &str, port: u16, allocated_until: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.lock();
        if *state == NodeState::Cancelled {
            return Err(RigError::StateMismatch(format!(
                "cannot allocate {}: node was cancelled",
                host
            )));
        }
        *state = NodeState::Allocated {
            host: host.to_string(),
            port,
            allocated_until,
        };
        Ok(())
    }

    pub fn cancel(&self) {
        *self.lock() = NodeState::Cancelled;
    }

    /// SSH target for this node. Fails if it is not allocated or expired.
    pub fn target(&self) -> Result<SshTarget> {
        let state = self.state();
        match state {
            NodeState::Unallocated => Err(RigError::StateMismatch("node is not allocated yet".into())),
            NodeState::Cancelled => Err(RigError::StateMismatch("node allocation was cancelled".into())),
            NodeState::Allocated {
                host,
                port,
                allocated_until,
            } => {
                if let Some(until) = allocated_until {
                    if self.ctx.now() > until {
                        return Err(RigError::StateMismatch(format!(
                            "allocation of {} expired at {}",
                            host, until
                        )));
                    }
                }
                if self.access {
                    Ok(self.ctx.access_target())
                } else {
                    Ok(self.ctx.node_target(&host, port))
                }
            }
        }
    }

    /// Run `command` with the cluster's default command timeout.
    pub fn run(&self, command: &str) -> Result<String> {
        self.run_with_timeout(command, self.ctx.command_timeout())
    }

    pub fn run_with_timeout(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let target = self.target()?;
        self.ctx.channel().run(&target, command, timeout)
    }

    /// Replace `path` with `contents` (temp file, then rename), creating the
    /// parent directory and applying `mode` if given.
    pub fn write_file(&self, path: &str, contents: &str, mode: Option<&str>) -> Result<()> {
        let tmp = format!("{}.tmp", path);
        let mut command = String::new();
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                command.push_str(&format!("mkdir -p {} && ", shell::quote(dir)));
            }
        }
        command.push_str(&format!(
            "printf '%s' {} > {} && mv {} {}",
            shell::quote(contents),
            shell::quote(&tmp),
            shell::quote(&tmp),
            shell::quote(path)
        ));
        if let Some(mode) = mode {
            command.push_str(&format!(" && chmod {} {}", mode, shell::quote(path)));
        }
        self.run(&command).map(|_| ())
    }

    /// `rm -f path`, logging instead of failing.
    pub fn remove_file_best_effort(&self, path: &str) {
        if let Err(e) = self.run(&format!("rm -f {}", shell::quote(path))) {
            log::warn!("could not remove {} on {}: {}", path, self, e);
        }
    }

    /// The remote binding for `port` on this node, as seen from the access node.
    fn remote_binding(&self, port: u16) -> Result<Binding> {
        self.target()?;
        let host = match (self.access, self.host()) {
            (true, _) => LOOPBACK.to_string(),
            (false, Some(host)) => host,
            (false, None) => return Err(RigError::StateMismatch("node is not allocated".into())),
        };
        Ok(Binding::new(&host, port))
    }

    /// Forward local `here` (0 for any) to `there` on this node.
    pub fn tunnel(&self, there: u16, here: u16) -> Result<Tunnel> {
        let bindings = [Binding::local(here), self.remote_binding(there)?];
        tunnel::build(&bindings, &self.ctx.access_target(), self.ctx.launcher())
    }

    /// `tunnel` under the `tunnel_open` policy, falling back to any local port.
    pub fn tunnel_with_fallback(&self, there: u16, here: u16) -> Result<Tunnel> {
        let bindings = [Binding::local(here), self.remote_binding(there)?];
        tunnel::build_with_fallback(
            &bindings,
            &self.ctx.access_target(),
            self.ctx.launcher(),
            self.ctx.policy(RetryName::TunnelOpen),
            self.ctx.clock(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("access", &self.access)
            .field("cores", &self.cores)
            .field("memory", &self.memory)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            NodeState::Allocated { host, port, .. } => write!(f, "{}:{}", host, port),
            NodeState::Unallocated => f.write_str("<unallocated>"),
            NodeState::Cancelled => f.write_str("<cancelled>"),
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
