//! # replication
//!
//! why: move the leader's log onto followers and decide what is committed
//! relations: extends RaftNode (node.rs); falls back to snapshot.rs when a
//!            follower needs entries that were compacted away
//! what: propose, replication_request, AppendEntries handler/response, commit rule

use crate::error::{RaftError, Result};
use crate::message::{AppendEntriesArgs, AppendEntriesReply, RaftRequest};
use crate::node::{NodeState, RaftNode};
use crate::{LogEntry, PeerId};

impl RaftNode {
    /// Append a command as leader. Returns (index, term) it will occupy if
    /// it ever commits; no guarantee that it will.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(u64, u64)> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader {
                term: self.current_term,
            });
        }

        let index = self.log.last_index() + 1;
        let term = self.current_term;
        self.log.append(LogEntry::new(term, index, command));
        self.persist()?;

        // a lone node is its own majority
        self.advance_commit_index();

        tracing::debug!(node_id = self.id, term, index, "command appended");
        Ok((index, term))
    }

    /// What the leader should send `peer` this round.
    ///
    /// `None` when not leader, or when there is nothing new and this is
    /// not a heartbeat round.
    pub fn replication_request(&self, peer: PeerId, heartbeat: bool) -> Result<Option<RaftRequest>> {
        if self.state != NodeState::Leader {
            return Ok(None);
        }

        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);

        if next <= self.log.base_index() {
            return self.snapshot_request().map(Some);
        }

        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            return self.snapshot_request().map(Some);
        };

        let entries = self.log.entries_from(next).to_vec();
        if entries.is_empty() && !heartbeat {
            return Ok(None);
        }

        Ok(Some(RaftRequest::AppendEntries(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        })))
    }

    /// AppendEntries handler
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> Result<AppendEntriesReply> {
        if args.term < self.current_term {
            return Ok(AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: None,
            });
        }

        self.set_new_term(args.term)?;
        if self.state == NodeState::Candidate {
            self.become_follower();
        }
        self.leader_id = Some(args.leader_id);
        self.reset_election_timer();

        // entries at or below our sentinel are already covered by a snapshot
        let base = self.log.base_index();
        let (prev_index, prev_term, entries) = if args.prev_log_index < base {
            let skip = (base - args.prev_log_index) as usize;
            let rest = args.entries.get(skip..).unwrap_or(&[]);
            (base, self.log.base_term(), rest)
        } else {
            (args.prev_log_index, args.prev_log_term, &args.entries[..])
        };

        if prev_index > self.log.last_index() {
            tracing::debug!(
                node_id = self.id,
                prev_log_index = prev_index,
                last_index = self.log.last_index(),
                "append rejected: log too short"
            );
            return Ok(AppendEntriesReply {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: Some(self.log.last_index() + 1),
            });
        }

        if let Some(term) = self.log.term_at(prev_index) {
            if term != prev_term {
                let first = self.log.first_index_of_term(term, prev_index);
                tracing::debug!(
                    node_id = self.id,
                    prev_log_index = prev_index,
                    local_term = term,
                    leader_term = prev_term,
                    "append rejected: term mismatch"
                );
                return Ok(AppendEntriesReply {
                    term: self.current_term,
                    success: false,
                    conflict_term: Some(term),
                    conflict_index: Some(first),
                });
            }
        }

        let mut changed = false;
        for (i, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                // already have it: a retransmission must not truncate
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    debug_assert!(entry.index > self.commit_index, "committed entry overwritten");
                    self.log.truncate_suffix(entry.index);
                }
                None => {}
            }
            for e in &entries[i..] {
                self.log.append(e.clone());
            }
            changed = true;
            break;
        }
        if changed {
            self.persist()?;
        }

        let last_new = args.prev_log_index + args.entries.len() as u64;
        if args.leader_commit > self.commit_index {
            let commit = args.leader_commit.min(last_new).min(self.log.last_index());
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        Ok(AppendEntriesReply {
            term: self.current_term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        })
    }

    /// Fold a follower's AppendEntries reply into leader state.
    ///
    /// Returns true when the commit index moved.
    pub fn handle_append_entries_response(
        &mut self,
        peer: PeerId,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> Result<bool> {
        if reply.term > self.current_term {
            self.set_new_term(reply.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Leader || self.current_term != args.term {
            return Ok(false);
        }

        let matched = self.match_index.get(&peer).copied().unwrap_or(0);
        let next = self.next_index.get(&peer).copied().unwrap_or(1);

        if reply.success {
            let replicated = args.prev_log_index + args.entries.len() as u64;
            if replicated > matched {
                self.match_index.insert(peer, replicated);
            }
            if replicated + 1 > next {
                self.next_index.insert(peer, replicated + 1);
            }
            return Ok(self.advance_commit_index());
        }

        let target = match (reply.conflict_term, reply.conflict_index) {
            (Some(term), Some(index)) => match self.log.last_index_of_term(term) {
                Some(last) => last + 1,
                None => index,
            },
            (None, Some(index)) => index,
            _ => args.prev_log_index,
        };
        let target = target.max(matched + 1).max(1);
        if target < next {
            tracing::debug!(node_id = self.id, peer, from = next, to = target, "backing off next index");
            self.next_index.insert(peer, target);
        }
        Ok(false)
    }

    /// Commit the highest current-term index stored on a majority.
    ///
    /// Entries from earlier terms are never committed by counting; they
    /// commit along with a later entry of this term.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }

        let quorum = self.quorum_size();
        let mut index = self.log.last_index();
        while index > self.commit_index {
            match self.log.term_at(index) {
                Some(term) if term == self.current_term => {
                    let replicas = 1 + self.match_index.values().filter(|m| **m >= index).count();
                    if replicas >= quorum {
                        tracing::debug!(node_id = self.id, index, replicas, "commit index advanced");
                        self.commit_index = index;
                        return true;
                    }
                }
                _ => break,
            }
            index -= 1;
        }
        false
    }
}
