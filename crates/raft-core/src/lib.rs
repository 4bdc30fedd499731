//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: persists through raft-storage, talks to peers through a
//!            Transport, exercised end to end by raft-sim
//! what: state machine, election logic, log replication, snapshots, runtime

pub mod apply;
pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod persist;
pub mod raft;
pub mod replication;
pub mod snapshot;
pub mod transport;

/// Identifier of a cluster member
pub type PeerId = u64;

pub use config::{random_election_timeout, RaftConfig};
pub use error::{RaftError, Result, TransportError};
pub use log::{Log, LogEntry};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    RaftReply, RaftRequest, RequestVoteArgs, RequestVoteReply,
};
pub use node::{NodeState, NodeStatus, RaftNode};
pub use raft::Raft;
pub use transport::Transport;
