//! # cluster
//!
//! why: drive a whole raft cluster the way a replicated service would
//! relations: starts raft-core Raft peers on network.rs, persists each one
//!            in a raft-storage MemoryPersister
//! what: Cluster harness, per-node apply checkers, leader/term/commit probes

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use raft_core::{ApplyMsg, PeerId, Raft, RaftConfig, RaftError};
use raft_storage::{MemoryPersister, Persister};

use crate::network::Network;

/// How often an apply checker wakes up to notice its peer was killed
const CHECKER_POLL: Duration = Duration::from_millis(100);

/// What each node has applied, as seen by its service
#[derive(Default)]
struct Applied {
    /// per node: index -> command
    logs: HashMap<PeerId, BTreeMap<u64, Vec<u8>>>,
    last_applied: HashMap<PeerId, u64>,
    /// first safety violation seen by any checker
    error: Option<String>,
}

impl Applied {
    fn fail(&mut self, message: String) {
        tracing::error!(%message, "apply check failed");
        self.error.get_or_insert(message);
    }

    /// Record `command` at `index` on `id`, checking it against every
    /// other node that applied the same index.
    fn record(&mut self, id: PeerId, index: u64, command: Vec<u8>) {
        let conflict = self.logs.iter().find_map(|(other, log)| {
            log.get(&index)
                .filter(|existing| **existing != command)
                .map(|existing| {
                    format!(
                        "node {id} applied {:?} at index {index}, node {other} applied {:?}",
                        String::from_utf8_lossy(&command),
                        String::from_utf8_lossy(existing)
                    )
                })
        });
        if let Some(message) = conflict {
            self.fail(message);
            return;
        }
        self.logs.entry(id).or_default().insert(index, command);
    }

    fn apply(&mut self, id: PeerId, msg: &ApplyMsg) {
        let last = self.last_applied.get(&id).copied().unwrap_or(0);
        match msg {
            ApplyMsg::Command { command, index } => {
                if *index != last + 1 {
                    self.fail(format!("node {id} applied index {index} after {last}"));
                    return;
                }
                self.record(id, *index, command.clone());
                self.last_applied.insert(id, *index);
            }
            ApplyMsg::Snapshot { data, index, .. } => {
                if *index <= last {
                    self.fail(format!("node {id} got snapshot at {index} after applying {last}"));
                    return;
                }
                let entries: Vec<(u64, Vec<u8>)> = match serde_json::from_slice(data) {
                    Ok(entries) => entries,
                    Err(e) => {
                        self.fail(format!("node {id} got undecodable snapshot: {e}"));
                        return;
                    }
                };
                self.logs.insert(id, BTreeMap::new());
                for (i, command) in entries {
                    self.record(id, i, command);
                }
                self.last_applied.insert(id, *index);
            }
        }
    }

    /// The service state through `index`, as snapshot bytes
    fn snapshot_of(&self, id: PeerId, index: u64) -> Vec<u8> {
        let entries: Vec<(u64, &Vec<u8>)> = self
            .logs
            .get(&id)
            .map(|log| log.range(..=index).map(|(i, c)| (*i, c)).collect())
            .unwrap_or_default();
        serde_json::to_vec(&entries).unwrap_or_default()
    }
}

/// A test cluster of peers 1..=n on one in-process network.
pub struct Cluster {
    ids: Vec<PeerId>,
    config: RaftConfig,
    network: Arc<Network>,
    rafts: HashMap<PeerId, Raft>,
    persisters: HashMap<PeerId, Arc<MemoryPersister>>,
    applied: Arc<Mutex<Applied>>,
    /// take a snapshot every this many applied commands
    snapshot_every: Option<u64>,
}

impl Cluster {
    /// Start `n` connected peers over a reliable network
    pub fn new(n: usize) -> Self {
        Self::build(n, None)
    }

    /// Like `new`, with a service that snapshots every `every` commands
    pub fn with_snapshots(n: usize, every: u64) -> Self {
        Self::build(n, Some(every))
    }

    fn build(n: usize, snapshot_every: Option<u64>) -> Self {
        crate::init_tracing();
        let ids: Vec<PeerId> = (1..=n as PeerId).collect();
        let mut cluster = Self {
            ids: ids.clone(),
            config: RaftConfig::default(),
            network: Network::new(),
            rafts: HashMap::new(),
            persisters: ids.iter().map(|id| (*id, Arc::new(MemoryPersister::new()))).collect(),
            applied: Arc::new(Mutex::new(Applied::default())),
            snapshot_every,
        };
        for id in ids {
            cluster.start(id);
            cluster.connect(id);
        }
        cluster
    }

    pub fn ids(&self) -> &[PeerId] {
        &self.ids
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Live handle for `id`, if it is running
    pub fn raft(&self, id: PeerId) -> Option<&Raft> {
        self.rafts.get(&id)
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.network.set_reliable(!unreliable);
    }

    pub fn connect(&self, id: PeerId) {
        self.network.connect(id);
    }

    pub fn disconnect(&self, id: PeerId) {
        self.network.disconnect(id);
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.network.is_connected(id)
    }

    /// Start (or restart) `id` from whatever its persister holds.
    ///
    /// Does not connect it.
    pub fn start(&mut self, id: PeerId) {
        self.crash(id);

        let persister = self.persisters[&id].clone();
        let (tx, rx) = channel::unbounded();
        let raft = match Raft::new(
            id,
            self.ids.clone(),
            self.config.clone(),
            persister as Arc<dyn Persister>,
            Arc::new(self.network.endpoint(id)),
            tx,
        ) {
            Ok(raft) => raft,
            Err(e) => panic!("node {id} failed to start: {e}"),
        };

        {
            let mut applied = self.applied.lock();
            applied.logs.remove(&id);
            applied.last_applied.remove(&id);
        }
        self.spawn_checker(id, raft.clone(), rx);
        self.network.register(id, raft.clone());
        self.rafts.insert(id, raft);
    }

    /// Kill `id`, keeping what it persisted. Its persister is swapped for
    /// a detached copy so late writes from the dead instance are lost.
    pub fn crash(&mut self, id: PeerId) {
        self.network.disconnect(id);
        self.network.remove(id);
        if let Some(raft) = self.rafts.remove(&id) {
            raft.kill();
        }
        let copy = Arc::new(self.persisters[&id].copy());
        self.persisters.insert(id, copy);
    }

    fn spawn_checker(&self, id: PeerId, raft: Raft, rx: Receiver<ApplyMsg>) {
        let applied = self.applied.clone();
        let snapshot_every = self.snapshot_every;
        let spawned = thread::Builder::new()
            .name(format!("apply-check-{id}"))
            .spawn(move || loop {
                let msg = match rx.recv_timeout(CHECKER_POLL) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) if raft.killed() => break,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let snapshot = {
                    let mut applied = applied.lock();
                    // a restart clears this node's record under the same lock
                    if raft.killed() {
                        break;
                    }
                    applied.apply(id, &msg);
                    match (&msg, snapshot_every) {
                        // snapshot the boundary once the entry after it is applied,
                        // so it sits strictly below the last log index
                        (ApplyMsg::Command { index, .. }, Some(every))
                            if *index > 1 && (index - 1) % every == 0 =>
                        {
                            let boundary = index - 1;
                            Some((boundary, applied.snapshot_of(id, boundary)))
                        }
                        _ => None,
                    }
                };
                if let Some((index, data)) = snapshot {
                    if let Err(e) = raft.snapshot(index, &data) {
                        tracing::warn!(node_id = id, index, error = %e, "snapshot failed");
                    }
                }
            });
        if let Err(e) = spawned {
            panic!("could not spawn apply checker for node {id}: {e}");
        }
    }

    /// Panic if any checker saw a safety violation
    pub fn check_apply_errors(&self) {
        if let Some(error) = &self.applied.lock().error {
            panic!("apply error: {error}");
        }
    }

    /// Wait for exactly one leader among connected peers; returns it.
    pub fn check_one_leader(&self) -> PeerId {
        for _ in 0..10 {
            let ms = rand::thread_rng().gen_range(450..550);
            thread::sleep(Duration::from_millis(ms));

            let mut leaders: BTreeMap<u64, Vec<PeerId>> = BTreeMap::new();
            for (id, raft) in &self.rafts {
                if !self.is_connected(*id) {
                    continue;
                }
                let (term, is_leader) = raft.get_state();
                if is_leader {
                    leaders.entry(term).or_default().push(*id);
                }
            }

            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {term} has {} leaders: {ids:?}", ids.len());
            }
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// All connected peers agree on the term; returns it.
    pub fn check_terms(&self) -> u64 {
        let mut agreed = None;
        for (id, raft) in &self.rafts {
            if !self.is_connected(*id) {
                continue;
            }
            let (term, _) = raft.get_state();
            match agreed {
                None => agreed = Some(term),
                Some(t) => assert_eq!(t, term, "servers disagree on term"),
            }
        }
        agreed.unwrap_or(0)
    }

    /// No connected peer thinks it is leader
    pub fn check_no_leader(&self) {
        for (id, raft) in &self.rafts {
            if self.is_connected(*id) {
                let (_, is_leader) = raft.get_state();
                assert!(!is_leader, "expected no leader among connected servers, but {id} claims");
            }
        }
    }

    /// How many peers applied `index`, and the command they agree on
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        self.check_apply_errors();
        let applied = self.applied.lock();
        let mut count = 0;
        let mut command = None;
        for id in &self.ids {
            if let Some(c) = applied.logs.get(id).and_then(|log| log.get(&index)) {
                if let Some(seen) = &command {
                    assert_eq!(seen, c, "committed values do not match at index {index}");
                }
                count += 1;
                command = Some(c.clone());
            }
        }
        (count, command)
    }

    /// Wait until at least `n` peers applied `index`.
    ///
    /// Returns the agreed command, or None if some peer moved to a later
    /// term (the entry may never commit).
    pub fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<Vec<u8>> {
        let mut pause = Duration::from_millis(10);
        for _ in 0..30 {
            let (count, _) = self.n_committed(index);
            if count >= n {
                break;
            }
            thread::sleep(pause);
            pause = (pause * 2).min(Duration::from_secs(1));
            if let Some(start_term) = start_term {
                if self.rafts.values().any(|r| r.get_state().0 > start_term) {
                    return None;
                }
            }
        }
        let (count, command) = self.n_committed(index);
        assert!(count >= n, "only {count} decided for index {index}; wanted {n}");
        command
    }

    /// Get `command` committed on at least `expected` peers; returns its
    /// index.
    ///
    /// Keeps looking for a leader that accepts it. With `retry`, a leader
    /// that accepted it but failed to commit gets another try.
    pub fn one(&self, command: &[u8], expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut starts = 0usize;
        while Instant::now() < deadline {
            let mut index = None;
            for offset in 0..self.ids.len() {
                starts = (starts + 1) % self.ids.len();
                let id = self.ids[(starts + offset) % self.ids.len()];
                if !self.is_connected(id) {
                    continue;
                }
                let Some(raft) = self.rafts.get(&id) else {
                    continue;
                };
                match raft.start(command.to_vec()) {
                    Ok((i, _)) => {
                        index = Some(i);
                        break;
                    }
                    Err(RaftError::NotLeader { .. }) | Err(RaftError::Killed) => {}
                    Err(e) => panic!("start on node {id} failed: {e}"),
                }
            }

            if let Some(index) = index {
                let until = Instant::now() + Duration::from_secs(2);
                while Instant::now() < until {
                    let (count, committed) = self.n_committed(index);
                    if count >= expected && committed.as_deref() == Some(command) {
                        return index;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                if !retry {
                    panic!("one({:?}) failed to reach agreement", String::from_utf8_lossy(command));
                }
            } else {
                thread::sleep(Duration::from_millis(50));
            }
        }
        panic!("one({:?}) failed to reach agreement", String::from_utf8_lossy(command));
    }

    /// Highest index applied by `id`
    pub fn last_applied(&self, id: PeerId) -> u64 {
        self.applied.lock().last_applied.get(&id).copied().unwrap_or(0)
    }

    pub fn rpc_total(&self) -> u64 {
        self.network.rpc_count()
    }

    pub fn bytes_total(&self) -> u64 {
        self.network.bytes_sent()
    }

    /// Kill every peer
    pub fn cleanup(&mut self) {
        let ids = self.ids.clone();
        for id in ids {
            self.crash(id);
        }
        self.check_apply_errors();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for raft in self.rafts.values() {
            raft.kill();
        }
    }
}
