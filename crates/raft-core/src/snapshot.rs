//! # snapshot
//!
//! why: bound log growth and bring followers past the compacted prefix
//! relations: extends RaftNode (node.rs); used by replication.rs when a
//!            follower's next index is no longer in the leader's log
//! what: consumer-driven compaction, InstallSnapshot request/handler/response

use crate::error::Result;
use crate::message::{ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply, RaftRequest};
use crate::node::{NodeState, RaftNode};
use crate::PeerId;

impl RaftNode {
    /// The service has captured its state through `index`; drop the log
    /// up to there and store `data` as the snapshot.
    ///
    /// Ignored unless `index` is past the current boundary, below the last
    /// log index, and already applied. Returns whether compaction happened.
    pub fn snapshot(&mut self, index: u64, data: &[u8]) -> Result<bool> {
        let base = self.log.base_index();
        if index <= base || index >= self.log.last_index() {
            tracing::debug!(
                node_id = self.id,
                index,
                base_index = base,
                last_index = self.log.last_index(),
                "snapshot outside retained range ignored"
            );
            return Ok(false);
        }
        if index > self.last_applied {
            tracing::warn!(
                node_id = self.id,
                index,
                last_applied = self.last_applied,
                "snapshot of unapplied entries ignored"
            );
            return Ok(false);
        }

        self.log.compact_to(index);
        self.persist_with_snapshot(data)?;

        tracing::debug!(
            node_id = self.id,
            last_included_index = index,
            last_included_term = self.log.base_term(),
            retained = self.log.len(),
            "log compacted"
        );
        Ok(true)
    }

    /// InstallSnapshot carrying the stored snapshot and our sentinel
    pub fn snapshot_request(&self) -> Result<RaftRequest> {
        let sentinel = self.log.sentinel();
        Ok(RaftRequest::InstallSnapshot(InstallSnapshotArgs {
            term: self.current_term,
            leader_id: self.id,
            last_included_index: sentinel.index,
            last_included_term: sentinel.term,
            offset: 0,
            data: self.read_snapshot()?,
            done: true,
            first_log_entry: sentinel.clone(),
        }))
    }

    /// InstallSnapshot handler
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> Result<InstallSnapshotReply> {
        if args.term < self.current_term {
            return Ok(InstallSnapshotReply {
                term: self.current_term,
            });
        }

        self.set_new_term(args.term)?;
        if self.state == NodeState::Candidate {
            self.become_follower();
        }
        self.leader_id = Some(args.leader_id);
        self.reset_election_timer();

        let pending = self.pending_snapshot.as_ref().map_or(0, ApplyMsg::index);
        if args.last_included_index <= self.commit_index || args.last_included_index <= pending {
            return Ok(InstallSnapshotReply {
                term: self.current_term,
            });
        }

        self.log.install_sentinel(args.first_log_entry.clone());
        self.persist_with_snapshot(&args.data)?;

        self.pending_snapshot = Some(ApplyMsg::Snapshot {
            data: args.data.clone(),
            term: args.last_included_term,
            index: args.last_included_index,
        });

        tracing::info!(
            node_id = self.id,
            leader = args.leader_id,
            last_included_index = args.last_included_index,
            last_included_term = args.last_included_term,
            "snapshot installed"
        );

        Ok(InstallSnapshotReply {
            term: self.current_term,
        })
    }

    /// Fold a follower's InstallSnapshot reply into leader state.
    ///
    /// Returns true when the commit index moved.
    pub fn handle_install_snapshot_response(
        &mut self,
        peer: PeerId,
        args: &InstallSnapshotArgs,
        reply: &InstallSnapshotReply,
    ) -> Result<bool> {
        if reply.term > self.current_term {
            self.set_new_term(reply.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Leader || self.current_term != args.term {
            return Ok(false);
        }

        let replicated = args.last_included_index;
        let matched = self.match_index.entry(peer).or_insert(0);
        *matched = (*matched).max(replicated);
        let next = self.next_index.entry(peer).or_insert(0);
        *next = (*next).max(replicated + 1);

        Ok(self.advance_commit_index())
    }
}
