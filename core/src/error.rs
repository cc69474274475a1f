//! Error taxonomy shared by every rig subsystem.
//!
//! Transient failures (SSH hiccups, forwarders that fail to bind) are retried
//! under the named retry policies. Everything else surfaces immediately:
//! validation problems, state mismatches, timeouts and, above all, teardown
//! verification failures, which mean a process is still running on shared
//! infrastructure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("remote command on {host} failed: {message}")]
    Remote { host: String, message: String },

    #[error("tunnel failed: {0}")]
    Tunnel(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("state mismatch: {0}")]
    StateMismatch(String),

    #[error("process {pid} on {host} is still alive after teardown")]
    TeardownVerification { host: String, pid: u32 },

    #[error("could not parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RigError {
    pub fn remote(host: impl Into<String>, message: impl Into<String>) -> Self {
        RigError::Remote {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        RigError::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// Whether a retry policy may try the failed operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, RigError::Remote { .. } | RigError::Tunnel(_) | RigError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, RigError>;
