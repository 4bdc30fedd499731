//! # network
//!
//! why: an in-process stand-in for the wire that can lose, delay and cut
//! relations: implements raft-core's Transport; cluster.rs registers peers
//! what: Network registry with per-node connectivity, Endpoint transport

use parking_lot::Mutex;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use raft_core::{PeerId, Raft, RaftReply, RaftRequest, Transport, TransportError};

/// Longest random delay on an unreliable network
const MAX_DELAY_MS: u64 = 27;
/// Per-mille chance a request or reply is lost on an unreliable network
const DROP_PER_MILLE: u32 = 100;
/// How long a call to an unreachable peer takes to fail
const UNREACHABLE_DELAY_MS: u64 = 10;

#[derive(Default)]
struct NetState {
    peers: HashMap<PeerId, Raft>,
    connected: HashSet<PeerId>,
    reliable: bool,
}

/// Shared in-process network.
///
/// A call only gets through when both ends are connected at send time
/// and still connected when the reply comes back.
pub struct Network {
    state: Mutex<NetState>,
    rpc_count: AtomicU64,
    bytes: AtomicU64,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState {
                reliable: true,
                ..NetState::default()
            }),
            rpc_count: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }

    /// Transport for peer `from` to talk through this network
    pub fn endpoint(self: &Arc<Self>, from: PeerId) -> Endpoint {
        Endpoint {
            network: self.clone(),
            from,
        }
    }

    /// Route calls for `id` to `raft` (replacing any earlier instance)
    pub fn register(&self, id: PeerId, raft: Raft) {
        self.state.lock().peers.insert(id, raft);
    }

    /// Forget `id`; calls to it fail until it is registered again
    pub fn remove(&self, id: PeerId) {
        self.state.lock().peers.remove(&id);
    }

    pub fn connect(&self, id: PeerId) {
        tracing::debug!(peer = id, "connect");
        self.state.lock().connected.insert(id);
    }

    pub fn disconnect(&self, id: PeerId) {
        tracing::debug!(peer = id, "disconnect");
        self.state.lock().connected.remove(&id);
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.state.lock().connected.contains(&id)
    }

    /// Toggle random delay and loss
    pub fn set_reliable(&self, reliable: bool) {
        self.state.lock().reliable = reliable;
    }

    /// Total calls attempted so far
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::Relaxed)
    }

    /// Total request bytes that reached a peer
    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn route(&self, from: PeerId, to: PeerId) -> Option<(Raft, bool)> {
        let state = self.state.lock();
        if !state.connected.contains(&from) || !state.connected.contains(&to) {
            return None;
        }
        state.peers.get(&to).map(|raft| (raft.clone(), state.reliable))
    }

    fn call(&self, from: PeerId, to: PeerId, request: RaftRequest) -> Result<RaftReply, TransportError> {
        self.rpc_count.fetch_add(1, Ordering::Relaxed);

        let Some((target, reliable)) = self.route(from, to) else {
            thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(0..UNREACHABLE_DELAY_MS)));
            return Err(TransportError::Unreachable(to));
        };

        if !reliable {
            let mut rng = rand::thread_rng();
            thread::sleep(Duration::from_millis(rng.gen_range(0..=MAX_DELAY_MS)));
            if rng.gen_range(0..1000) < DROP_PER_MILLE {
                return Err(TransportError::Timeout(to));
            }
        }

        // every request crosses the wire as bytes
        let wire = encode(&request)?;
        self.bytes.fetch_add(wire.len() as u64, Ordering::Relaxed);
        let request: RaftRequest = decode(&wire)?;

        let reply = target
            .handle(request)
            .map_err(|_| TransportError::Unreachable(to))?;

        // the reply is lost if either side was cut off meanwhile
        if self.route(from, to).is_none() {
            return Err(TransportError::Unreachable(to));
        }
        if !reliable && rand::thread_rng().gen_range(0..1000) < DROP_PER_MILLE {
            return Err(TransportError::Timeout(to));
        }

        decode(&encode(&reply)?)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

/// One peer's view of the network
pub struct Endpoint {
    network: Arc<Network>,
    from: PeerId,
}

impl Transport for Endpoint {
    fn call(&self, peer: PeerId, request: RaftRequest) -> Result<RaftReply, TransportError> {
        self.network.call(self.from, peer, request)
    }
}
