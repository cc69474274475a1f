//! Jupyter notebook on an allocated node, reached through a local tunnel.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RigError};
use crate::rig::context::ClusterContext;
use crate::rig::deployment::{deploy, Deployment, DeploymentScript, GenericDeploymentSnapshot};
use crate::rig::node::NodeHandle;
use crate::rig::retry::RetryName;
use crate::shell;

/// Line the notebook script prints before starting the server.
pub const PORT_MARKER: &str = "RIG_NOTEBOOK_PORT=";

/// Shell line that stores a free TCP port in `$var`.
pub(crate) fn free_port_line(var: &str) -> String {
    format!(
        "{}=$(python3 -c \"import socket; s = socket.socket(); s.bind((\\\"\\\", 0)); print(s.getsockname()[1])\")",
        var
    )
}

pub fn notebook_script(setup: &[String], host: &str, token: &str) -> String {
    DeploymentScript::new()
        .setup(setup.iter().cloned())
        .command(free_port_line("PORT"))
        .command(format!("echo \"{}$PORT\"", PORT_MARKER))
        .command(format!(
            "jupyter notebook --no-browser --ip={} --port=\"$PORT\" --NotebookApp.token={}",
            shell::quote(host),
            token
        ))
        .render()
}

/// The port reported by a notebook script, if it has printed it yet.
pub fn parse_port(output: &str) -> Option<u16> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(PORT_MARKER))
        .and_then(|port| port.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookSnapshot {
    pub deployment: GenericDeploymentSnapshot,
    pub remote_port: u16,
    pub token: String,
}

pub struct NotebookDeployment {
    uuid: Uuid,
    deployment: Deployment,
    remote_port: u16,
    token: String,
}

/// Start a notebook on `node` and tunnel it to `local_port` (0 for any).
/// Anything failing after launch cancels the deployment again.
pub fn deploy_notebook(node: &Arc<NodeHandle>, local_port: u16) -> Result<NotebookDeployment> {
    let ctx = node.context().clone();
    let host = node
        .host()
        .ok_or_else(|| RigError::StateMismatch("notebook node is not allocated".into()))?;
    let token = Uuid::new_v4().simple().to_string();
    let script = notebook_script(&ctx.config().setup_actions.notebook, &host, &token);

    let mut deployment = deploy(node, &script)?;
    match connect(&ctx, &mut deployment, local_port) {
        Ok(remote_port) => {
            let notebook = NotebookDeployment {
                uuid: Uuid::new_v4(),
                deployment,
                remote_port,
                token,
            };
            log::info!("notebook {} available at {}", notebook.uuid, notebook.local_url());
            Ok(notebook)
        }
        Err(e) => {
            if let Err(cancel_err) = deployment.cancel() {
                log::warn!("cancelling failed notebook deployment: {}", cancel_err);
            }
            Err(e)
        }
    }
}

fn connect(ctx: &ClusterContext, deployment: &mut Deployment, local_port: u16) -> Result<u16> {
    let remote_port = match parse_port(deployment.output()) {
        Some(port) => port,
        None => {
            let host = deployment.node().host().unwrap_or_default();
            ctx.retry(RetryName::NotebookPort, || {
                let output = deployment.read_output()?;
                parse_port(&output)
                    .ok_or_else(|| RigError::remote(&host, "notebook has not reported its port yet"))
            })?
        }
    };
    let tunnel = deployment.node().tunnel_with_fallback(remote_port, local_port)?;
    deployment.add_tunnel(tunnel);
    Ok(remote_port)
}

impl NotebookDeployment {
    /// Rebind a serialized notebook to `ctx`, opening a new tunnel on any
    /// free local port.
    pub fn from_snapshot(ctx: &Arc<ClusterContext>, uuid: Uuid, snapshot: &NotebookSnapshot) -> Result<Self> {
        let mut deployment = Deployment::from_snapshot(ctx, &snapshot.deployment);
        let tunnel = deployment.node().tunnel_with_fallback(snapshot.remote_port, 0)?;
        deployment.add_tunnel(tunnel);
        Ok(NotebookDeployment {
            uuid,
            deployment,
            remote_port: snapshot.remote_port,
            token: snapshot.token.clone(),
        })
    }

    pub fn snapshot(&self) -> NotebookSnapshot {
        NotebookSnapshot {
            deployment: self.deployment.snapshot(),
            remote_port: self.remote_port,
            token: self.token.clone(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_port(&self) -> Option<u16> {
        self.deployment.tunnels().first().map(|t| t.here())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn local_url(&self) -> String {
        format!(
            "http://localhost:{}/?token={}",
            self.local_port().unwrap_or(0),
            self.token
        )
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.deployment.cancel()
    }
}

impl fmt::Debug for NotebookDeployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotebookDeployment")
            .field("uuid", &self.uuid)
            .field("deployment", &self.deployment)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}
