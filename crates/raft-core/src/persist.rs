//! # persist
//!
//! why: turn {current_term, voted_for, log} into the opaque raft-state blob
//! relations: called by node.rs on every mutation of persistent state
//! what: encode / decode with validation

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::{Log, PeerId};

#[derive(Serialize)]
struct PersistentStateRef<'a> {
    current_term: u64,
    voted_for: Option<PeerId>,
    log: &'a Log,
}

/// Decoded raft-state blob
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
    pub log: Log,
}

pub fn encode(current_term: u64, voted_for: Option<PeerId>, log: &Log) -> Result<Vec<u8>> {
    let state = PersistentStateRef {
        current_term,
        voted_for,
        log,
    };
    Ok(serde_json::to_vec(&state)?)
}

/// Decode a blob; an empty blob means a node that never persisted anything
pub fn decode(data: &[u8]) -> Result<Option<PersistentState>> {
    if data.is_empty() {
        return Ok(None);
    }
    let state: PersistentState = serde_json::from_slice(data)?;
    state.log.validate().map_err(RaftError::CorruptState)?;
    if state.log.last_term() > state.current_term {
        return Err(RaftError::CorruptState(format!(
            "log term {} ahead of current term {}",
            state.log.last_term(),
            state.current_term
        )));
    }
    Ok(Some(state))
}
