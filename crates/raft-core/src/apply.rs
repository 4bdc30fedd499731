//! # apply
//!
//! why: hand committed state to the service exactly once, in index order
//! relations: extends RaftNode (node.rs); drained by the apply thread in raft.rs
//! what: next_apply cursor over pending snapshot + committed entries

use crate::message::ApplyMsg;
use crate::node::RaftNode;

impl RaftNode {
    /// Whether `next_apply` would return something
    pub fn has_pending_apply(&self) -> bool {
        self.pending_snapshot.is_some() || self.last_applied < self.commit_index
    }

    /// Next message for the service, advancing `last_applied` past it.
    ///
    /// A pending snapshot always goes first; after it, `last_applied` and
    /// `commit_index` both sit at its last included index. Neither ever
    /// moves backwards.
    pub fn next_apply(&mut self) -> Option<ApplyMsg> {
        if let Some(msg) = self.pending_snapshot.take() {
            let index = msg.index();
            self.last_applied = self.last_applied.max(index);
            self.commit_index = self.commit_index.max(index);
            return Some(msg);
        }

        if self.last_applied >= self.commit_index {
            return None;
        }

        let index = self.last_applied + 1;
        let Some(entry) = self.log.get(index) else {
            // only reachable if the prefix was compacted without a snapshot
            // being queued; nothing sane can be delivered
            tracing::error!(
                node_id = self.id,
                index,
                base_index = self.log.base_index(),
                "committed entry missing from log"
            );
            return None;
        };
        let msg = ApplyMsg::Command {
            command: entry.command.clone(),
            index,
        };
        self.last_applied = index;
        Some(msg)
    }

    /// Drain everything currently deliverable
    pub fn get_entries_to_apply(&mut self) -> Vec<ApplyMsg> {
        std::iter::from_fn(|| self.next_apply()).collect()
    }
}
