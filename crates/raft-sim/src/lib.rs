//! # raft-sim
//!
//! why: exercise real raft peers end to end without sockets
//! relations: runs raft-core Raft handles over an in-process Network,
//!            persisting into raft-storage MemoryPersisters
//! what: lossy/partitionable network, cluster harness with apply checkers

pub mod cluster;
pub mod network;

pub use cluster::Cluster;
pub use network::{Endpoint, Network};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}
