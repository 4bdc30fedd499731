//! # election
//!
//! why: leader election - randomized timeouts, vote requests, vote granting
//! relations: extends RaftNode (node.rs); driven by the ticker in raft.rs
//! what: start_election, handle_vote_request, handle_vote_response

use crate::error::Result;
use crate::message::{RequestVoteArgs, RequestVoteReply};
use crate::node::{NodeState, RaftNode};
use crate::PeerId;

impl RaftNode {
    /// Become candidate for the next term and build the vote request.
    ///
    /// A single-node cluster wins on its own vote and returns as leader.
    pub fn start_election(&mut self) -> Result<RequestVoteArgs> {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        self.persist()?;
        self.reset_election_timer();

        tracing::info!(node_id = self.id, term = self.current_term, "starting election");

        if self.has_quorum() {
            self.become_leader();
        }

        Ok(RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Whether a candidate's log is at least as up to date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let my_term = self.log.last_term();
        last_log_term > my_term
            || (last_log_term == my_term && last_log_index >= self.log.last_index())
    }

    /// RequestVote handler
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> Result<RequestVoteReply> {
        if args.term < self.current_term {
            tracing::debug!(
                node_id = self.id,
                candidate = args.candidate_id,
                term = args.term,
                current_term = self.current_term,
                "rejecting vote: stale term"
            );
            return Ok(RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.set_new_term(args.term)?;

        let free_to_vote = match self.voted_for {
            None => true,
            Some(v) => v == args.candidate_id,
        };
        let up_to_date = self.is_log_up_to_date(args.last_log_index, args.last_log_term);

        let vote_granted = free_to_vote && up_to_date;
        if vote_granted {
            self.voted_for = Some(args.candidate_id);
            self.persist()?;
            self.reset_election_timer();
        }

        tracing::debug!(
            node_id = self.id,
            candidate = args.candidate_id,
            term = self.current_term,
            vote_granted,
            up_to_date,
            "vote request handled"
        );

        Ok(RequestVoteReply {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Count a vote reply for the election started in `request_term`.
    ///
    /// Returns true exactly when this reply made us leader.
    pub fn handle_vote_response(
        &mut self,
        from: PeerId,
        request_term: u64,
        reply: &RequestVoteReply,
    ) -> Result<bool> {
        if reply.term > self.current_term {
            self.set_new_term(reply.term)?;
            return Ok(false);
        }

        // stale: the election this reply belongs to is over
        if self.state != NodeState::Candidate || self.current_term != request_term {
            return Ok(false);
        }

        if reply.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }

        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }
}
