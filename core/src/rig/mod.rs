//! Cluster resources over SSH: the "rig" subsystem.
//!
//! Everything needed to obtain nodes from a shared cluster's workload manager
//! and run services on them: cluster configuration, the remote channel, the
//! allocation engine, generic deployments, multi-hop tunnels, and the shared
//! document that lets deployments be rediscovered by later client processes.
//!
//! Remote commands are plain shell strings run through a `RemoteChannel`;
//! port forwards are processes opened through a `ForwarderLauncher`. Both are
//! injected via `ClusterContext`, so tests run against in-process fakes.

pub mod allocation;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod context;
pub mod deployment;
pub mod node;
pub mod pool;
pub mod remote;
pub mod retry;
pub mod sync;
pub mod tunnel;
