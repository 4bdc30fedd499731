//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: built and consumed by election.rs, replication.rs, snapshot.rs;
//!            carried by transport.rs implementations
//! what: RequestVote, AppendEntries, InstallSnapshot pairs, ApplyMsg

use serde::{Deserialize, Serialize};

use crate::{LogEntry, PeerId};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Response to AppendEntries
///
/// On a log mismatch `conflict_term` is the follower's term at
/// `prev_log_index` (None when its log is too short) and
/// `conflict_index` the first index it holds for that term (or one past
/// its last entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_term: Option<u64>,
    pub conflict_index: Option<u64>,
}

/// Ship the leader's snapshot to a follower whose next entry was compacted
///
/// `offset`/`done` describe chunking; transfers are always single-shot
/// (`offset == 0`, `done == true`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: PeerId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
    /// the entry that becomes the follower's sentinel
    pub first_log_entry: LogEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Any inbound peer RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

impl RaftRequest {
    /// Method name, for logs and per-method counters
    pub fn method(&self) -> &'static str {
        match self {
            Self::RequestVote(_) => "Raft.RequestVote",
            Self::AppendEntries(_) => "Raft.AppendEntries",
            Self::InstallSnapshot(_) => "Raft.InstallSnapshot",
        }
    }
}

/// Reply to a `RaftRequest`, same variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    InstallSnapshot(InstallSnapshotReply),
}

/// What the consuming service receives, strictly in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A newly committed command
    Command { command: Vec<u8>, index: u64 },
    /// Replace the service state with this snapshot
    Snapshot { data: Vec<u8>, term: u64, index: u64 },
}

impl ApplyMsg {
    /// Highest log index this message covers
    pub fn index(&self) -> u64 {
        match self {
            Self::Command { index, .. } | Self::Snapshot { index, .. } => *index,
        }
    }
}
