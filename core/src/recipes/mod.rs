//! Ready-made deployments composed from the rig primitives.

pub mod compute_cluster;
pub mod notebook;
