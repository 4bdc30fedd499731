//! # raft
//!
//! why: run a RaftNode against real time, a transport and a consumer
//! relations: owns node.rs under one mutex; sends through transport.rs;
//!            delivers ApplyMsg on a crossbeam channel
//! what: Raft handle, ticker thread, apply thread, per-RPC sender threads

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use raft_storage::Persister;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::message::{ApplyMsg, RaftReply, RaftRequest};
use crate::node::{NodeStatus, RaftNode};
use crate::transport::Transport;
use crate::PeerId;

/// Handle to a running Raft peer. Cheap to clone; all clones share the
/// same node.
#[derive(Clone)]
pub struct Raft {
    shared: Arc<Shared>,
}

struct Shared {
    id: PeerId,
    config: RaftConfig,
    /// every piece of mutable consensus state lives behind this one lock
    node: Mutex<RaftNode>,
    /// wakes the apply thread; always used with `node`
    apply_cond: Condvar,
    dead: AtomicBool,
    transport: Arc<dyn Transport>,
    apply_tx: Sender<ApplyMsg>,
}

impl Raft {
    /// Start a peer: restore from `persister`, then spawn the ticker and
    /// apply threads. Returns quickly.
    pub fn new(
        id: PeerId,
        cluster_nodes: Vec<PeerId>,
        config: RaftConfig,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn Transport>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Result<Self> {
        let node = RaftNode::restore(id, cluster_nodes, config.clone(), persister)?;

        let shared = Arc::new(Shared {
            id,
            config,
            node: Mutex::new(node),
            apply_cond: Condvar::new(),
            dead: AtomicBool::new(false),
            transport,
            apply_tx,
        });

        let ticker = shared.clone();
        thread::Builder::new()
            .name(format!("raft-{id}-ticker"))
            .spawn(move || ticker.run_ticker())?;

        let applier = shared.clone();
        thread::Builder::new()
            .name(format!("raft-{id}-apply"))
            .spawn(move || applier.run_applier())?;

        Ok(Self { shared })
    }

    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    /// Propose a command. Ok((index, term)) if this node is leader; the
    /// entry may still never commit.
    pub fn start(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        if self.killed() {
            return Err(RaftError::Killed);
        }
        let mut node = self.shared.node.lock();
        let before = node.commit_index;
        let proposed = match node.propose(command) {
            Ok(proposed) => proposed,
            Err(e @ RaftError::NotLeader { .. }) => return Err(e),
            Err(e) => {
                self.shared.fail(&e);
                return Err(e);
            }
        };
        self.shared.broadcast(&node, false);
        if node.commit_index > before {
            self.shared.apply_cond.notify_one();
        }
        Ok(proposed)
    }

    /// (current term, believes it is leader)
    pub fn get_state(&self) -> (u64, bool) {
        self.shared.node.lock().get_state()
    }

    /// The service has applied through `index` and captured that state in
    /// `data`; compact the log accordingly.
    pub fn snapshot(&self, index: u64, data: &[u8]) -> Result<()> {
        let mut node = self.shared.node.lock();
        if let Err(e) = node.snapshot(index, data) {
            self.shared.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Dispatch an inbound peer RPC. A killed node does not answer.
    pub fn handle(&self, request: RaftRequest) -> Result<RaftReply> {
        if self.killed() {
            return Err(RaftError::Killed);
        }
        let mut node = self.shared.node.lock();
        let result = match &request {
            RaftRequest::RequestVote(args) => node.handle_vote_request(args).map(RaftReply::RequestVote),
            RaftRequest::AppendEntries(args) => {
                node.handle_append_entries(args).map(RaftReply::AppendEntries)
            }
            RaftRequest::InstallSnapshot(args) => {
                node.handle_install_snapshot(args).map(RaftReply::InstallSnapshot)
            }
        };
        match result {
            Ok(reply) => {
                if node.has_pending_apply() {
                    self.shared.apply_cond.notify_one();
                }
                Ok(reply)
            }
            Err(e) => {
                self.shared.fail(&e);
                Err(e)
            }
        }
    }

    /// Cooperative shutdown: background threads exit on their next turn,
    /// in-flight RPC replies are ignored.
    pub fn kill(&self) {
        self.shared.kill();
    }

    pub fn killed(&self) -> bool {
        self.shared.killed()
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.node.lock().status()
    }

    /// Known leader for the current term, if any
    pub fn leader_id(&self) -> Option<PeerId> {
        self.shared.node.lock().leader_id
    }

    /// Size of the persisted raft state, for the service's snapshot policy
    pub fn raft_state_size(&self) -> usize {
        self.shared.node.lock().raft_state_size()
    }
}

impl Shared {
    fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        {
            // flag under the lock so the apply thread cannot miss the wakeup
            let _node = self.node.lock();
            self.dead.store(true, Ordering::SeqCst);
        }
        self.apply_cond.notify_all();
    }

    /// Persistence failed: we can no longer promise durability, so stop
    /// participating. Called with the node lock held.
    fn fail(&self, err: &RaftError) {
        tracing::error!(node_id = self.id, error = %err, "raft node failed, shutting down");
        self.dead.store(true, Ordering::SeqCst);
        self.apply_cond.notify_all();
    }

    fn run_ticker(self: Arc<Self>) {
        let period = self.config.heartbeat();
        while !self.killed() {
            thread::sleep(period);
            if self.killed() {
                break;
            }

            let mut node = self.node.lock();
            if node.is_leader() {
                self.broadcast(&node, true);
                node.reset_election_timer();
            } else if node.election_timed_out() {
                match node.start_election() {
                    Ok(args) => {
                        if node.is_leader() {
                            self.broadcast(&node, true);
                        } else {
                            let peers: Vec<PeerId> = node.peers().collect();
                            for peer in peers {
                                self.send(peer, RaftRequest::RequestVote(args.clone()));
                            }
                        }
                    }
                    Err(e) => self.fail(&e),
                }
            }
        }
        tracing::debug!(node_id = self.id, "ticker stopped");
    }

    fn run_applier(self: Arc<Self>) {
        let mut node = self.node.lock();
        while !self.killed() {
            let Some(msg) = node.next_apply() else {
                self.apply_cond.wait(&mut node);
                continue;
            };
            tracing::trace!(node_id = self.id, index = msg.index(), "applying");
            // never block the consumer while holding the lock
            let sent = MutexGuard::unlocked(&mut node, || self.apply_tx.send(msg));
            if sent.is_err() {
                tracing::debug!(node_id = self.id, "apply channel closed");
                break;
            }
        }
        tracing::debug!(node_id = self.id, "apply loop stopped");
    }

    /// Queue one replication request per follower. Called with the lock
    /// held; the RPCs themselves run on their own threads.
    fn broadcast(self: &Arc<Self>, node: &RaftNode, heartbeat: bool) {
        for peer in node.peers() {
            match node.replication_request(peer, heartbeat) {
                Ok(Some(request)) => self.send(peer, request),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(node_id = self.id, peer, error = %e, "could not build replication request");
                }
            }
        }
    }

    fn send(self: &Arc<Self>, peer: PeerId, request: RaftRequest) {
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("raft-{}-rpc", self.id))
            .spawn(move || shared.call(peer, request));
        if let Err(e) = spawned {
            tracing::warn!(node_id = self.id, peer, error = %e, "could not spawn rpc thread");
        }
    }

    /// One outbound RPC, issued without the lock; the reply is interpreted
    /// under the lock against whatever term/role we are in by then.
    fn call(self: Arc<Self>, peer: PeerId, request: RaftRequest) {
        let reply = match self.transport.call(peer, request.clone()) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer, method = request.method(), error = %e, "rpc failed");
                return;
            }
        };
        if self.killed() {
            return;
        }

        let mut node = self.node.lock();
        let before = node.commit_index;
        let outcome = match (&request, &reply) {
            (RaftRequest::RequestVote(args), RaftReply::RequestVote(r)) => {
                let won = node.handle_vote_response(peer, args.term, r);
                if let Ok(true) = won {
                    // announce leadership right away
                    self.broadcast(&node, true);
                }
                won.map(|_| ())
            }
            (RaftRequest::AppendEntries(args), RaftReply::AppendEntries(r)) => {
                node.handle_append_entries_response(peer, args, r).map(|_| ())
            }
            (RaftRequest::InstallSnapshot(args), RaftReply::InstallSnapshot(r)) => {
                node.handle_install_snapshot_response(peer, args, r).map(|_| ())
            }
            _ => {
                tracing::warn!(node_id = self.id, peer, method = request.method(), "reply does not match request");
                Ok(())
            }
        };
        match outcome {
            Ok(()) if node.commit_index > before => {
                self.apply_cond.notify_one();
            }
            Ok(()) => {}
            Err(e) => self.fail(&e),
        }
    }
}
