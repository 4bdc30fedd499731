//! # config
//!
//! why: timing knobs for elections and heartbeats
//! relations: read by node.rs (election deadline) and raft.rs (ticker period)
//! what: RaftConfig with defaults and validation, random election timeout

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Configuration for a Raft node (all values in milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    pub election_timeout_min: u64,
    /// Maximum election timeout
    pub election_timeout_max: u64,
    /// Leader heartbeat period, also the ticker period
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 {
            return Err(RaftError::InvalidConfig("election_timeout_min must be > 0".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) > election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig("heartbeat_interval must be > 0".into()));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// A fresh randomized election timeout from this config's band
    pub fn election_timeout(&self) -> Duration {
        random_election_timeout(self.election_timeout_min, self.election_timeout_max)
    }
}

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}
