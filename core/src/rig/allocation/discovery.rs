//! Port discovery for per-job sshd instances.
//!
//! Each node's entry point appends `<host>:<port>` to the job's discovery file
//! on shared storage. The client reads the file once the job runs, removes it,
//! and matches reported ports to nodes.

use crate::error::{Result, RigError};
use crate::rig::allocation::entry_point::discovery_file;
use crate::rig::node::NodeHandle;
use crate::rig::retry::{retry, RetryName};
use crate::shell;

/// Reported `host:port` entries, in the order they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortLookup {
    entries: Vec<(String, u16)>,
}

impl PortLookup {
    /// Parse discovery file contents. Malformed lines are skipped.
    pub fn parse(text: &str) -> PortLookup {
        let mut entries = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.rsplit_once(':').and_then(|(h, p)| Some((h, p.parse::<u16>().ok()?))) {
                Some((host, port)) if !host.is_empty() => entries.push((host.to_string(), port)),
                _ => log::warn!("ignoring malformed port discovery entry '{}'", line),
            }
        }
        PortLookup { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return the most recently written port reported by `host`.
    pub fn take(&mut self, host: &str) -> Option<u16> {
        let idx = self.entries.iter().rposition(|(h, _)| h == host)?;
        Some(self.entries.remove(idx).1)
    }

    /// Port for `host`: its own latest report, else the first remaining report
    /// (nodes that all see the same hostname), else `default`. With `strict`
    /// the last fallback is an error.
    pub fn resolve(&mut self, host: &str, default: u16, strict: bool) -> Result<u16> {
        if let Some(port) = self.take(host) {
            return Ok(port);
        }
        if let Some((reported, port)) = self.entries.first() {
            log::warn!(
                "no port reported by {}; using port {} reported by {}",
                host,
                port,
                reported
            );
            return Ok(*port);
        }
        if strict {
            return Err(RigError::StateMismatch(format!(
                "no sshd port reported for {}",
                host
            )));
        }
        log::warn!("no sshd port reported for {}; assuming {}", host, default);
        Ok(default)
    }
}

/// Read the discovery file of `job_id` through `access`, retrying while it is
/// missing or has fewer than `node_count` entries. The file is removed after a
/// successful read. A file that never appears yields an empty lookup.
pub fn fetch(access: &NodeHandle, job_id: u64, node_count: u32) -> Result<PortLookup> {
    let ctx = access.context().clone();
    let path = discovery_file(&ctx.config().rig_dir, job_id);
    let policy = ctx.policy(RetryName::PortInfo).scaled(node_count);
    let mut partial: Option<PortLookup> = None;

    let result = retry(RetryName::PortInfo, policy, ctx.clock(), || {
        let text = access.run(&format!("cat {}", shell::quote(&path)))?;
        let lookup = PortLookup::parse(&text);
        if lookup.len() < node_count as usize {
            let message = format!("{} of {} nodes reported a port", lookup.len(), node_count);
            partial = Some(lookup);
            return Err(RigError::remote(&ctx.config().host, message));
        }
        Ok(lookup)
    });

    let lookup = match (result, partial) {
        (Ok(lookup), _) => lookup,
        (Err(e), Some(lookup)) => {
            log::warn!("port discovery for job {} incomplete: {}", job_id, e);
            lookup
        }
        (Err(e), None) if e.is_transient() => {
            log::warn!("port discovery file for job {} never appeared: {}", job_id, e);
            return Ok(PortLookup::default());
        }
        (Err(e), None) => return Err(e),
    };

    access.remove_file_best_effort(&path);
    Ok(lookup)
}
