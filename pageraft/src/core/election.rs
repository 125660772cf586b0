//! Candidate conversion, voting, pre-vote and TimeoutNow handling.

use std::collections::BTreeSet;

use crate::core::CandidateVolatile;
use crate::core::LeaderVolatile;
use crate::core::RaftCore;
use crate::core::Volatile;
use crate::error::VoteRejectReason;
use crate::message::Message;
use crate::message::TimeoutNowRequest;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::progress::Progress;
use crate::NodeId;
use crate::ServerState;

impl RaftCore {
    /// Start an election round. With pre-vote enabled the first round is
    /// non-persistent; a TimeoutNow target skips straight to a real
    /// election (`disrupt_leader`).
    pub(crate) fn convert_to_candidate(&mut self, disrupt_leader: bool) {
        let from = self.state.kind();
        debug_assert!(self.membership.is_voter(self.id));

        let in_pre_vote = self.config.pre_vote && !disrupt_leader;
        let timeout = self.randomized_election_timeout();
        let mut votes = BTreeSet::new();
        votes.insert(self.id);

        if !in_pre_vote {
            let term = self.current_term + 1;
            self.current_term = term;
            self.voted_for = Some(self.id);
            self.push_effect(crate::core::Effect::SetTerm { term });
            self.push_effect(crate::core::Effect::SetVote { voted_for: Some(self.id) });
        }

        self.state = Volatile::Candidate(CandidateVolatile {
            randomized_election_timeout: timeout,
            votes,
            in_pre_vote,
            disrupt_leader,
        });
        self.election_timer_start = self.now;
        if from != ServerState::Candidate {
            self.push_effect(crate::core::Effect::StateChange { from, to: ServerState::Candidate });
        }
        tracing::info!(
            id = self.id,
            term = self.current_term,
            pre_vote = in_pre_vote,
            disrupt_leader,
            "starting election"
        );

        let request_term = if in_pre_vote { self.current_term + 1 } else { self.current_term };
        let request = VoteRequest {
            version: VoteRequest::VERSION,
            term: request_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            disrupt_leader,
            pre_vote: in_pre_vote,
        };
        let voters: Vec<NodeId> = self.membership.voters().filter(|s| s.id != self.id).map(|s| s.id).collect();
        for voter in voters {
            self.send_message(voter, Message::RequestVote(request.clone()));
        }

        // A single-voter cluster elects itself on the spot.
        self.maybe_win_election();
    }

    /// Evaluate a vote request from `from`.
    pub(crate) fn handle_request_vote(&mut self, from: NodeId, req: VoteRequest) {
        debug_assert_eq!(from, req.candidate_id);

        let reject = self.vote_reject_reason(&req);
        let grant = reject.is_none();

        if let Some(reason) = reject {
            tracing::debug!(id = self.id, candidate = from, ?reason, pre_vote = req.pre_vote, "vote rejected");
        } else if !req.pre_vote {
            // A real grant is persisted before the reply leaves.
            self.voted_for = Some(req.candidate_id);
            self.push_effect(crate::core::Effect::SetVote { voted_for: Some(req.candidate_id) });
            self.election_timer_start = self.now;
            tracing::info!(id = self.id, candidate = from, term = self.current_term, "vote granted");
        }

        // Pre-vote replies echo the candidate's round term so stale
        // rounds can be told apart; real replies carry our term.
        let reply_term = if req.pre_vote { req.term } else { self.current_term };
        let reply = VoteResponse {
            version: VoteResponse::VERSION,
            term: reply_term,
            vote_granted: grant,
            pre_vote: req.pre_vote,
        };
        self.send_message(from, Message::RequestVoteResult(reply));
    }

    fn vote_reject_reason(&self, req: &VoteRequest) -> Option<VoteRejectReason> {
        if req.term < self.current_term {
            return Some(VoteRejectReason::StaleTerm);
        }

        // Deny candidates that are behind our log.
        let ours = (self.log.last_term(), self.log.last_index());
        if (req.last_log_term, req.last_log_index) < ours {
            return Some(VoteRejectReason::LogBehind);
        }

        // Deny disruption of a live leader, unless the candidate was
        // explicitly told to take over. A leader we have not heard from
        // for a full election timeout no longer counts as live.
        if !req.disrupt_leader {
            let have_leader = match &self.state {
                Volatile::Leader(_) => true,
                Volatile::Follower(f) => {
                    f.current_leader.is_some()
                        && self.now.saturating_sub(self.election_timer_start) < self.config.election_timeout
                }
                _ => false,
            };
            if have_leader {
                return Some(VoteRejectReason::HaveLeader);
            }
        }

        if req.pre_vote {
            return None;
        }

        // For a real vote the terms were already aligned by the caller.
        debug_assert_eq!(req.term, self.current_term);
        match self.voted_for {
            None => None,
            Some(id) if id == req.candidate_id => None,
            Some(for_id) => Some(VoteRejectReason::AlreadyVoted { for_id }),
        }
    }

    /// Tally a vote reply.
    pub(crate) fn handle_request_vote_result(&mut self, from: NodeId, res: VoteResponse) {
        let Volatile::Candidate(candidate) = &mut self.state else { return };

        // Replies from an earlier round (or the wrong kind of round) are
        // stale and must not be counted.
        if res.pre_vote != candidate.in_pre_vote {
            return;
        }
        let round_term = if candidate.in_pre_vote { self.current_term + 1 } else { self.current_term };
        if res.term != round_term {
            return;
        }
        if !res.vote_granted {
            return;
        }
        candidate.votes.insert(from);
        self.maybe_win_election();
    }

    fn maybe_win_election(&mut self) {
        let Volatile::Candidate(candidate) = &self.state else { return };
        let granted = candidate.votes.iter().filter(|id| self.membership.is_voter(**id)).count();
        if granted < self.membership.quorum() {
            return;
        }

        if candidate.in_pre_vote {
            tracing::info!(id = self.id, term = self.current_term, "pre-vote quorum reached; starting real election");
            let disrupt = candidate.disrupt_leader;
            self.start_real_election(disrupt);
        } else {
            self.become_leader();
        }
    }

    /// Promote a successful pre-vote round into a persistent election.
    fn start_real_election(&mut self, disrupt_leader: bool) {
        let term = self.current_term + 1;
        self.current_term = term;
        self.voted_for = Some(self.id);
        self.push_effect(crate::core::Effect::SetTerm { term });
        self.push_effect(crate::core::Effect::SetVote { voted_for: Some(self.id) });

        let timeout = self.randomized_election_timeout();
        let mut votes = BTreeSet::new();
        votes.insert(self.id);
        self.state = Volatile::Candidate(CandidateVolatile {
            randomized_election_timeout: timeout,
            votes,
            in_pre_vote: false,
            disrupt_leader,
        });
        self.election_timer_start = self.now;

        let request = VoteRequest {
            version: VoteRequest::VERSION,
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            disrupt_leader,
            pre_vote: false,
        };
        let voters: Vec<NodeId> = self.membership.voters().filter(|s| s.id != self.id).map(|s| s.id).collect();
        for voter in voters {
            self.send_message(voter, Message::RequestVote(request.clone()));
        }
        self.maybe_win_election();
    }

    pub(crate) fn become_leader(&mut self) {
        let from = self.state.kind();
        let mut progress = std::collections::BTreeMap::new();
        for server in self.membership.servers() {
            if server.id != self.id {
                progress.insert(server.id, Progress::new(self.log.last_index(), self.now));
            }
        }
        self.state = Volatile::Leader(LeaderVolatile {
            progress,
            requests: std::collections::VecDeque::new(),
            change: None,
            catch_up: None,
            sessions: std::collections::BTreeMap::new(),
        });
        self.election_timer_start = self.now;
        tracing::info!(id = self.id, term = self.current_term, "elected leader");
        self.push_effect(crate::core::Effect::StateChange { from, to: ServerState::Leader });

        // A barrier flushes the pipeline and lets prior-term entries
        // commit under the new term.
        self.leader_append(crate::entry::Entry::new_barrier(self.current_term));
        self.replicate_appended();
    }

    /// TimeoutNow: the leader asks us to take over immediately.
    pub(crate) fn handle_timeout_now(&mut self, from: NodeId, req: TimeoutNowRequest) {
        if req.term < self.current_term {
            return;
        }
        if !self.membership.is_voter(self.id) {
            return;
        }
        if matches!(self.state, Volatile::Leader(_)) {
            return;
        }
        // Entries still being persisted would not be visible to the vote
        // predicate; let the transfer expire instead.
        if self.appends_in_flight() > 0 {
            return;
        }
        tracing::info!(id = self.id, from, "received TimeoutNow; starting disruptive election");
        self.convert_to_candidate(true);
    }
}
