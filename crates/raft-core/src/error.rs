//! # error
//!
//! why: one error vocabulary for the consensus engine and its seams
//! relations: returned by node.rs / raft.rs operations, transport.rs calls
//! what: RaftError, TransportError, Result alias

use thiserror::Error;

use crate::PeerId;

#[derive(Error, Debug)]
pub enum RaftError {
    /// `start` on a node that does not believe it is leader
    #[error("not the leader (current term {term})")]
    NotLeader { term: u64 },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("node has been killed")]
    Killed,
}

/// Failure to get an answer from a peer this round
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    #[error("rpc to peer {0} timed out")]
    Timeout(PeerId),

    #[error("wire codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
