//! Log replication: the leader's send paths and the follower's
//! AppendEntries handler.

use crate::core::RaftCore;
use crate::core::Volatile;
use crate::entry::EntryPayload;
use crate::membership::Role;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::Message;
use crate::message::DEFAULT_FEATURES;
use crate::progress::ProgressMode;
use crate::LogIndex;
use crate::Millis;
use crate::NodeId;

impl RaftCore {
    pub(crate) fn tick_leader(&mut self, now: Millis) {
        // Heartbeats, probes and pipeline keep-up. An entry-bearing send
        // within the interval refreshed the peer's timer already, so the
        // pacing check covers the heartbeat rule too.
        for peer in self.replication_targets() {
            let due = {
                let Volatile::Leader(leader) = &self.state else { return };
                let Some(progress) = leader.progress.get(&peer) else { continue };
                progress.mode != ProgressMode::Snapshot
                    && (progress.last_send == 0 || now >= progress.last_send + self.config.heartbeat_timeout)
            };
            if due {
                self.send_append(peer);
            }
        }

        self.tick_install_sessions(now);
        self.tick_transfer(now);
        self.tick_catch_up(now);

        // Step down when a majority of voters went silent: a deposed
        // leader must not keep accepting doomed proposals.
        if now.saturating_sub(self.election_timer_start) >= self.config.election_timeout {
            if self.voter_contacts() < self.membership.quorum() {
                tracing::warn!(id = self.id, term = self.current_term, "lost contact with a majority; stepping down");
                self.become_follower(None);
            } else {
                self.election_timer_start = now;
            }
        }
    }

    /// The peers the leader replicates to: everyone but spares, plus a
    /// spare that is being caught up for promotion.
    pub(crate) fn replication_targets(&self) -> Vec<NodeId> {
        let Volatile::Leader(leader) = &self.state else { return Vec::new() };
        let promotee = leader.catch_up.as_ref().map(|c| c.promotee);
        self.membership
            .servers()
            .iter()
            .filter(|s| s.id != self.id)
            .filter(|s| s.role != Role::Spare || promotee == Some(s.id))
            .map(|s| s.id)
            .collect()
    }

    /// Push freshly appended entries to every pipelined peer. Probing
    /// peers wait for their ack or the next heartbeat slot.
    pub(crate) fn replicate_appended(&mut self) {
        for peer in self.replication_targets() {
            let pipelined = {
                let Volatile::Leader(leader) = &self.state else { return };
                leader.progress.get(&peer).map(|p| p.mode == ProgressMode::Pipeline).unwrap_or(false)
            };
            if pipelined {
                self.send_append(peer);
            }
        }
    }

    /// Build and send one AppendEntries to `peer`, switching to the
    /// snapshot-install protocol when the needed entries are gone.
    pub(crate) fn send_append(&mut self, peer: NodeId) {
        let (next_index, mode) = {
            let Volatile::Leader(leader) = &self.state else { return };
            let Some(progress) = leader.progress.get(&peer) else { return };
            (progress.next_index, progress.mode)
        };
        if mode == ProgressMode::Snapshot {
            return;
        }

        let first_available = if self.log.num_entries() > 0 {
            self.log.first_index()
        } else {
            self.log.snapshot_last_index() + 1
        };
        if next_index < first_available {
            self.start_install(peer);
            return;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_of(prev_log_index);
        let acquired = self.log.acquire(next_index, self.config.max_append_entries as usize);
        let entries: Vec<_> = acquired.iter().map(|e| e.to_wire()).collect();
        let last_sent = prev_log_index + entries.len() as LogIndex;

        let message = Message::AppendEntries(AppendEntriesRequest {
            version: AppendEntriesRequest::VERSION,
            term: self.current_term,
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
        });

        {
            let Volatile::Leader(leader) = &mut self.state else { return };
            let Some(progress) = leader.progress.get_mut(&peer) else { return };
            progress.last_send = self.now;
            if progress.mode == ProgressMode::Pipeline && last_sent >= progress.next_index {
                progress.optimistic_advance(last_sent);
            }
        }

        if acquired.is_empty() {
            self.send_message(peer, message);
        } else {
            self.send_append_message(peer, next_index, acquired, message);
        }
    }

    /// A send to `peer` failed at the transport; fall back to probing.
    pub(crate) fn on_append_send_failed(&mut self, peer: NodeId) {
        let Volatile::Leader(leader) = &mut self.state else { return };
        if let Some(progress) = leader.progress.get_mut(&peer) {
            if progress.mode == ProgressMode::Pipeline {
                tracing::debug!(id = self.id, peer, "append send failed; reverting to probe");
                progress.to_probe();
            }
        }
    }

    // ------------------------------------------------------------------
    // Follower side.

    pub(crate) fn handle_append_entries(&mut self, from: NodeId, req: AppendEntriesRequest) {
        if req.term < self.current_term {
            tracing::debug!(id = self.id, from, term = req.term, "AppendEntries from a stale term");
            self.reject_append(from, req.prev_log_index.max(1));
            return;
        }

        match self.state.kind() {
            crate::ServerState::Candidate => {
                // Someone else won this term.
                self.become_follower(Some(from));
            }
            crate::ServerState::Leader => {
                debug_assert!(false, "two leaders in term {}", self.current_term);
                return;
            }
            crate::ServerState::Unavailable => return,
            crate::ServerState::Follower => {}
        }
        if let Volatile::Follower(f) = &mut self.state {
            f.current_leader = Some(from);
        }
        self.election_timer_start = self.now;

        // Log-matching check. Everything at or below the commit index or
        // the snapshot anchor matches by definition.
        let prev = req.prev_log_index;
        if prev > 0 && prev > self.commit_index && prev > self.log.snapshot_last_index() {
            let local_term = self.log.term_of(prev);
            if local_term == 0 {
                // Our log is too short.
                self.reject_append(from, prev);
                return;
            }
            if local_term != req.prev_log_term {
                // Conflicting entry: drop it and everything after it,
                // then have the leader rewind.
                self.truncate_from(prev);
                self.reject_append(from, prev);
                return;
            }
        }

        // Skip entries we already have; delete from the first conflict.
        let mut entries = req.entries;
        let mut skipped = 0usize;
        for entry in &entries {
            let index = prev + 1 + skipped as LogIndex;
            if index > self.log.last_index() {
                break;
            }
            if self.log.term_of(index) == entry.term {
                skipped += 1;
                continue;
            }
            self.truncate_from(index);
            break;
        }
        let new_entries: Vec<_> = entries.drain(skipped..).collect();
        let n_new = new_entries.len();
        let first_new = prev + 1 + skipped as LogIndex;

        if n_new > 0 {
            for entry in &new_entries {
                debug_assert!(!entry.is_local);
                if let EntryPayload::Membership(m) = &entry.payload {
                    let index = self.log.last_index() + 1;
                    self.membership = m.clone();
                    self.membership_uncommitted_index = index;
                }
                self.log.append(entry.clone());
            }
            self.follower_append(from, first_new, new_entries);
        } else {
            // Heartbeat or fully duplicated batch: ack right away.
            self.send_append_ack(from);
        }

        // Only indices covered by this message are known consistent with
        // the leader; never commit past them.
        let consistent_up_to = prev + entries.len() as LogIndex + n_new as LogIndex;
        let new_commit = req.leader_commit.min(consistent_up_to);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed();
        }
    }

    fn reject_append(&mut self, to: NodeId, rejected: LogIndex) {
        let reply = AppendEntriesResponse {
            version: AppendEntriesResponse::VERSION,
            term: self.current_term,
            rejected,
            last_log_index: self.log.last_index(),
            features: DEFAULT_FEATURES,
        };
        self.send_message(to, Message::AppendEntriesResult(reply));
    }

    /// Positive ack, sent only once the entries involved are durable.
    pub(crate) fn send_append_ack(&mut self, to: NodeId) {
        let reply = AppendEntriesResponse {
            version: AppendEntriesResponse::VERSION,
            term: self.current_term,
            rejected: 0,
            last_log_index: self.last_stored,
            features: DEFAULT_FEATURES,
        };
        self.send_message(to, Message::AppendEntriesResult(reply));
    }

    // ------------------------------------------------------------------
    // Leader side: processing acks.

    pub(crate) fn handle_append_entries_result(&mut self, from: NodeId, res: AppendEntriesResponse) {
        if res.term < self.current_term {
            return;
        }
        let in_snapshot = {
            let Volatile::Leader(leader) = &mut self.state else { return };
            let Some(progress) = leader.progress.get_mut(&from) else { return };
            progress.features = res.features;
            progress.last_recv = self.now;
            progress.mode == ProgressMode::Snapshot
        };
        if in_snapshot {
            // The install session owns this peer until it finishes.
            return;
        }

        if res.rejected != 0 {
            let hint = res.last_log_index + 1;
            {
                let Volatile::Leader(leader) = &mut self.state else { return };
                let progress = leader.progress.get_mut(&from).expect("probed above");
                progress.rewind(hint, self.now);
            }
            tracing::debug!(id = self.id, peer = from, rejected = res.rejected, hint, "follower rejected; rewinding");
            self.send_append(from);
            return;
        }

        let acked = res.last_log_index.min(self.log.last_index());
        let behind = {
            let Volatile::Leader(leader) = &mut self.state else { return };
            let progress = leader.progress.get_mut(&from).expect("probed above");
            progress.ack(acked, self.now);
            progress.next_index <= self.log.last_index()
        };

        self.maybe_advance_commit();
        self.on_promotee_ack(from);
        self.on_transfer_target_ack(from);

        if behind {
            self.send_append(from);
        }
    }

    /// Advance the commit index to the highest majority-stored index of
    /// the current term. Entries from earlier terms commit only
    /// transitively.
    pub(crate) fn maybe_advance_commit(&mut self) {
        let new_commit = {
            let Volatile::Leader(leader) = &self.state else { return };
            let mut indices: Vec<LogIndex> = Vec::with_capacity(self.membership.voter_count());
            for voter in self.membership.voters() {
                if voter.id == self.id {
                    indices.push(self.last_stored);
                } else {
                    indices.push(leader.progress.get(&voter.id).map(|p| p.match_index).unwrap_or(0));
                }
            }
            if indices.is_empty() {
                return;
            }
            indices.sort_unstable_by(|a, b| b.cmp(a));
            indices[self.membership.quorum() - 1]
        };

        if new_commit > self.commit_index && self.log.term_of(new_commit) == self.current_term {
            tracing::debug!(id = self.id, from = self.commit_index, to = new_commit, "commit index advanced");
            self.commit_index = new_commit;
            self.apply_committed();
        }
    }

    /// Remove entries from `from` on, rolling back an uncommitted
    /// configuration that was sitting in the removed range.
    pub(crate) fn truncate_from(&mut self, from: LogIndex) {
        if from > self.log.last_index() {
            return;
        }
        if self.membership_uncommitted_index >= from {
            self.rollback_membership();
        }
        self.log.truncate(from);
        self.last_stored = self.last_stored.min(from.saturating_sub(1));
        self.push_effect(crate::core::Effect::Truncate { from });
    }
}
