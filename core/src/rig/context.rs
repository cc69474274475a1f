//! The session object passed through every call chain.
//!
//! A `ClusterContext` bundles one cluster's configuration with the execution
//! channel, forwarder launcher and clock used to act on it. Node handles,
//! allocations and deployments keep an `Arc` to the context they were created
//! in; nothing in the rig reaches for process-wide state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::Result;
use crate::rig::config::ClusterConfig;
use crate::rig::remote::{JumpHost, RemoteChannel, SshTarget};
use crate::rig::retry::{retry, RetryName, RetryPolicy};
use crate::rig::tunnel::ForwarderLauncher;

pub struct ClusterContext {
    config: ClusterConfig,
    channel: Arc<dyn RemoteChannel>,
    launcher: Arc<dyn ForwarderLauncher>,
    clock: Arc<dyn Clock>,
}

impl ClusterContext {
    pub fn new(
        config: ClusterConfig,
        channel: Arc<dyn RemoteChannel>,
        launcher: Arc<dyn ForwarderLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ClusterContext {
            config,
            channel,
            launcher,
            clock,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn channel(&self) -> &dyn RemoteChannel {
        self.channel.as_ref()
    }

    pub fn launcher(&self) -> &dyn ForwarderLauncher {
        self.launcher.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration)
    }

    /// Effective policy for `name`, config overrides applied.
    pub fn policy(&self, name: RetryName) -> RetryPolicy {
        self.config.retries.get(name)
    }

    /// Run `op` under the named policy.
    pub fn retry<T, F>(&self, name: RetryName, op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        retry(name, self.policy(name), self.clock(), op)
    }

    /// Timeout applied to each remote command; 0 disables it.
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.config.command_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn access_target(&self) -> SshTarget {
        SshTarget {
            host: self.config.host.clone(),
            port: self.config.port,
            user: self.config.user.clone(),
            ssh_key: self.config.ssh_key.clone(),
            jump: None,
        }
    }

    /// Target for a compute node, reached by jumping through the access node.
    pub fn node_target(&self, host: &str, port: u16) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            port,
            user: self.config.user.clone(),
            ssh_key: self.config.ssh_key.clone(),
            jump: Some(JumpHost {
                host: self.config.host.clone(),
                port: self.config.port,
                user: self.config.user.clone(),
            }),
        }
    }
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("cluster", &self.config.name)
            .field("access", &self.config.user_at_host())
            .finish()
    }
}
