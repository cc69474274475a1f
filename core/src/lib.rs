//! Cluster rig core: workload-manager allocations, remote deployments, SSH
//! tunnels and deployment synchronization.

pub mod clock;
pub mod error;
pub mod logger;
pub mod recipes;
pub mod rig;
pub mod shell;

#[cfg(test)]
mod testing;

pub use error::{Result, RigError};
pub use rig::cluster::Cluster;
