//! # transport
//!
//! why: keep the network out of the consensus core
//! relations: raft.rs sends through it; raft-sim provides the test network
//! what: Transport trait

use crate::error::TransportError;
use crate::message::{RaftReply, RaftRequest};
use crate::PeerId;

/// Outbound RPC seam: one blocking call per request.
///
/// Implementations must eventually return; an `Err` means "no answer
/// this round" and is never retried by the caller within the round.
pub trait Transport: Send + Sync {
    fn call(&self, peer: PeerId, request: RaftRequest) -> Result<RaftReply, TransportError>;
}
