//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: extended by election.rs, replication.rs, snapshot.rs, apply.rs;
//!            driven under a lock by raft.rs
//! what: NodeState enum, RaftNode struct, term management, persistence glue

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use raft_storage::{MemoryPersister, Persister};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::message::ApplyMsg;
use crate::{persist, Log, PeerId};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node, for observers and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub state: NodeState,
    pub term: u64,
    pub voted_for: Option<PeerId>,
    pub leader_id: Option<PeerId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub base_index: u64,
    pub last_log_index: u64,
}

/// A single Raft node in the cluster.
///
/// Pure state machine: no threads, no network. Every method that changes
/// `current_term`, `voted_for` or `log` persists before returning, so a
/// reply built from the returned value is always backed by stable storage.
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: PeerId,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<PeerId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<PeerId>,
    pub log: Log,
    /// Highest index known committed
    pub commit_index: u64,
    /// Highest index handed to the apply channel
    pub last_applied: u64,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<PeerId, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<PeerId, u64>,
    /// Candidate only: who granted us a vote this term (self included)
    pub votes_received: Vec<PeerId>,
    /// Last leader we heard from in the current term
    pub leader_id: Option<PeerId>,
    pub election_deadline: Instant,
    /// Snapshot waiting to be delivered ahead of any further command
    pub(crate) pending_snapshot: Option<ApplyMsg>,
    persister: Arc<dyn Persister>,
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("log", &format_args!("{}", self.log))
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .finish()
    }
}

impl RaftNode {
    /// Create a new Raft node in Follower state, backed by volatile memory
    pub fn new(id: PeerId, cluster_nodes: Vec<PeerId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    /// Like `new`, with explicit timing config
    pub fn with_config(id: PeerId, cluster_nodes: Vec<PeerId>, config: RaftConfig) -> Self {
        let deadline = Instant::now() + config.election_timeout();
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: Vec::new(),
            leader_id: None,
            election_deadline: deadline,
            pending_snapshot: None,
            persister: Arc::new(MemoryPersister::new()),
        }
    }

    /// Rebuild a node from whatever the persister holds.
    ///
    /// Fails if the stored state does not decode: a node must not vote or
    /// acknowledge entries without trustworthy term/vote/log.
    pub fn restore(
        id: PeerId,
        cluster_nodes: Vec<PeerId>,
        config: RaftConfig,
        persister: Arc<dyn Persister>,
    ) -> Result<Self> {
        config.validate()?;
        if !cluster_nodes.contains(&id) {
            return Err(RaftError::UnknownPeer(id));
        }

        let mut node = Self::with_config(id, cluster_nodes, config);
        node.persister = persister;

        if let Some(state) = persist::decode(&node.persister.read_raft_state()?)? {
            node.current_term = state.current_term;
            node.voted_for = state.voted_for;
            node.log = state.log;
        }

        // everything up to the sentinel is covered by the snapshot
        let base = node.log.base_index();
        node.commit_index = base;
        node.last_applied = base;

        // snapshot bytes are opaque: an empty one is still the state at `base`
        if base > 0 {
            node.pending_snapshot = Some(ApplyMsg::Snapshot {
                data: node.persister.read_snapshot()?,
                term: node.log.base_term(),
                index: base,
            });
        }

        tracing::info!(
            node_id = id,
            term = node.current_term,
            base_index = base,
            last_index = node.log.last_index(),
            "raft node restored"
        );
        Ok(node)
    }

    /// Number of votes / replicas that make a majority
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    /// Whether the votes collected this term form a majority
    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// Every other member of the cluster
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        let me = self.id;
        self.cluster_nodes.iter().copied().filter(move |p| *p != me)
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// (current term, believes it is leader)
    pub fn get_state(&self) -> (u64, bool) {
        (self.current_term, self.is_leader())
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Adopt a newer term, stepping down to follower.
    ///
    /// The only place `current_term` moves forward outside an election;
    /// lower or equal terms are ignored so the term never regresses.
    pub fn set_new_term(&mut self, term: u64) -> Result<bool> {
        if term <= self.current_term {
            return Ok(false);
        }
        if self.state != NodeState::Follower {
            tracing::info!(
                node_id = self.id,
                from = %self.state,
                old_term = self.current_term,
                new_term = term,
                "stepping down"
            );
        }
        self.current_term = term;
        self.voted_for = None;
        self.become_follower();
        self.persist()?;
        Ok(true)
    }

    /// Drop candidate/leader bookkeeping; term and vote are untouched
    pub fn become_follower(&mut self) {
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.leader_id = None;
    }

    /// Take leadership for the current term
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        let peers: Vec<PeerId> = self.peers().collect();
        self.next_index = peers.iter().map(|p| (*p, next)).collect();
        self.match_index = peers.iter().map(|p| (*p, 0)).collect();

        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            last_index = next - 1,
            "became leader"
        );
    }

    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.election_timeout();
    }

    pub fn election_timed_out(&self) -> bool {
        Instant::now() >= self.election_deadline
    }

    /// Write {current_term, voted_for, log}, keeping the stored snapshot
    pub fn persist(&self) -> Result<()> {
        let state = persist::encode(self.current_term, self.voted_for, &self.log)?;
        self.persister.save_raft_state(&state)?;
        Ok(())
    }

    /// Write raft state and a new snapshot in one call
    pub fn persist_with_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let state = persist::encode(self.current_term, self.voted_for, &self.log)?;
        self.persister.save(&state, snapshot)?;
        Ok(())
    }

    pub fn read_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.persister.read_snapshot()?)
    }

    pub fn raft_state_size(&self) -> usize {
        self.persister.raft_state_size()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            base_index: self.log.base_index(),
            last_log_index: self.log.last_index(),
        }
    }
}
