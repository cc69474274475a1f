//! Named retry policies.
//!
//! Every retryable operation in the rig has a name and an independent
//! `{count, seconds_between}` policy. Cluster configs may override any subset
//! of the defaults. `retry` runs an operation under a policy, retrying only
//! transient failures.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::Result;


// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times an operation may be retried after its first failure, and
/// how long to wait before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    pub seconds_between: u64,
}

impl RetryPolicy {
    pub fn new(count: u32, seconds_between: u64) -> Self {
        RetryPolicy {
            count,
            seconds_between,
        }
    }

    /// Policy with the same interval and `count` multiplied by `factor`
    /// (never below the original count).
    pub fn scaled(&self, factor: u32) -> Self {
        RetryPolicy {
            count: self.count.saturating_mul(factor.max(1)),
            seconds_between: self.seconds_between,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.seconds_between)
    }
}


// ---------------------------------------------------------------------------
// RetryName
// ---------------------------------------------------------------------------

/// Every named retryable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryName {
    PortInfo,
    JobStatusAfterSubmit,
    TunnelOpen,
    SchedulerConnect,
    CheckWorkerStarted,
    CancelDeployment,
    NotebookPort,
}

impl RetryName {
    pub const ALL: [RetryName; 7] = [
        RetryName::PortInfo,
        RetryName::JobStatusAfterSubmit,
        RetryName::TunnelOpen,
        RetryName::SchedulerConnect,
        RetryName::CheckWorkerStarted,
        RetryName::CancelDeployment,
        RetryName::NotebookPort,
    ];

    pub fn default_policy(self) -> RetryPolicy {
        match self {
            RetryName::PortInfo => RetryPolicy::new(5, 5),
            RetryName::JobStatusAfterSubmit => RetryPolicy::new(10, 3),
            RetryName::TunnelOpen => RetryPolicy::new(3, 2),
            RetryName::SchedulerConnect => RetryPolicy::new(6, 5),
            RetryName::CheckWorkerStarted => RetryPolicy::new(10, 3),
            RetryName::CancelDeployment => RetryPolicy::new(3, 1),
            RetryName::NotebookPort => RetryPolicy::new(10, 2),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetryName::PortInfo => "port_info",
            RetryName::JobStatusAfterSubmit => "job_status_after_submit",
            RetryName::TunnelOpen => "tunnel_open",
            RetryName::SchedulerConnect => "scheduler_connect",
            RetryName::CheckWorkerStarted => "check_worker_started",
            RetryName::CancelDeployment => "cancel_deployment",
            RetryName::NotebookPort => "notebook_port",
        }
    }
}

impl fmt::Display for RetryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


// ---------------------------------------------------------------------------
// RetryPolicies
// ---------------------------------------------------------------------------

/// Per-cluster overrides on top of the documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryPolicies {
    overrides: BTreeMap<RetryName, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// The effective policy for `name`.
    pub fn get(&self, name: RetryName) -> RetryPolicy {
        self.overrides
            .get(&name)
            .copied()
            .unwrap_or_else(|| name.default_policy())
    }

    pub fn set(&mut self, name: RetryName, policy: RetryPolicy) {
        self.overrides.insert(name, policy);
    }

    pub fn reset(&mut self, name: RetryName) {
        self.overrides.remove(&name);
    }

    pub fn is_overridden(&self, name: RetryName) -> bool {
        self.overrides.contains_key(&name)
    }
}


// ---------------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds, it fails with a non-transient error, or the
/// policy's retries are exhausted. Sleeps `seconds_between` before each retry,
/// so an operation that never succeeds sleeps exactly `count` times before its
/// last error is returned.
pub fn retry<T, F>(name: RetryName, policy: RetryPolicy, clock: &dyn Clock, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.count => {
                attempt += 1;
                log::debug!(
                    "{}: attempt {} failed ({}), retrying in {}s ({}/{})",
                    name,
                    attempt,
                    err,
                    policy.seconds_between,
                    attempt,
                    policy.count
                );
                clock.sleep(policy.delay());
            }
            Err(err) => {
                if err.is_transient() && policy.count > 0 {
                    log::warn!("{}: giving up after {} retries: {}", name, policy.count, err);
                }
                return Err(err);
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
