//! Membership changes: add, assign (with catch-up rounds), remove,
//! commit and rollback of configuration entries.

use crate::core::CatchUp;
use crate::core::PendingChange;
use crate::core::RaftCore;
use crate::core::RequestId;
use crate::core::RequestOutput;
use crate::core::Volatile;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::RaftError;
use crate::membership::Membership;
use crate::membership::Role;
use crate::progress::Progress;
use crate::LogIndex;
use crate::Millis;
use crate::NodeId;

impl RaftCore {
    /// Add a new server as a spare. It starts receiving entries only
    /// once assigned a replicating role.
    pub fn add_server(&mut self, request: RequestId, id: NodeId, address: &str, now: Millis) {
        self.now = now;
        if let Err(err) = self.accepting_changes() {
            self.push_request_done(request, Err(err));
            return;
        }
        let mut next = self.membership.clone();
        if let Err(err) = next.add(id, address, Role::Spare) {
            self.push_request_done(request, Err(err));
            return;
        }
        tracing::info!(leader = self.id, new_server = id, address, "adding server");
        self.append_membership(next, request);
    }

    /// Change a server's role. Promotions to voter of a server whose log
    /// is behind go through bounded catch-up rounds first.
    pub fn assign(&mut self, request: RequestId, id: NodeId, role: Role, now: Millis) {
        self.now = now;
        if let Err(err) = self.accepting_changes() {
            self.push_request_done(request, Err(err));
            return;
        }
        let Some(server) = self.membership.get(id) else {
            self.push_request_done(request, Err(RaftError::BadId));
            return;
        };
        if server.role == role {
            self.push_request_done(request, Err(RaftError::BadRole));
            return;
        }
        if id == self.id && role != Role::Voter && !self.membership.is_voter(self.id) {
            // A non-voting leader cannot exist; only reachable through
            // recover scenarios, refuse outright.
            self.push_request_done(request, Err(RaftError::BadRole));
            return;
        }

        let needs_catch_up = role == Role::Voter && id != self.id && {
            let Volatile::Leader(leader) = &self.state else { unreachable!() };
            let match_index = leader.progress.get(&id).map(|p| p.match_index).unwrap_or(0);
            match_index < self.log.last_index()
        };

        if !needs_catch_up {
            let mut next = self.membership.clone();
            next.assign(id, role).expect("server exists");
            tracing::info!(leader = self.id, server = id, role = %role, "assigning role");
            self.append_membership(next, request);
            return;
        }

        tracing::info!(leader = self.id, promotee = id, "promotion requires catch-up; starting round 1");
        let round_index = self.log.last_index();
        let Volatile::Leader(leader) = &mut self.state else { unreachable!() };
        leader.catch_up = Some(CatchUp {
            request,
            promotee: id,
            target_role: role,
            round: 1,
            round_index,
            round_start: now,
        });
        // The promotee may have been a spare with no replication yet.
        self.send_append(id);
    }

    /// Remove a server from the configuration.
    pub fn remove_server(&mut self, request: RequestId, id: NodeId, now: Millis) {
        self.now = now;
        if let Err(err) = self.accepting_changes() {
            self.push_request_done(request, Err(err));
            return;
        }
        let mut next = self.membership.clone();
        if let Err(err) = next.remove(id) {
            self.push_request_done(request, Err(err));
            return;
        }
        tracing::info!(leader = self.id, removed = id, "removing server");
        self.append_membership(next, request);
    }

    /// Only one change may be in flight, and only on an undisturbed
    /// leader.
    fn accepting_changes(&self) -> Result<(), RaftError> {
        self.accepting_proposals()?;
        let Volatile::Leader(leader) = &self.state else { return Err(RaftError::NotLeader) };
        if leader.change.is_some() || leader.catch_up.is_some() || self.membership_uncommitted_index != 0 {
            return Err(RaftError::CantChange);
        }
        Ok(())
    }

    /// Append the configuration entry; it takes effect immediately and
    /// completes the request when it commits.
    fn append_membership(&mut self, next: Membership, request: RequestId) {
        let entry = Entry::new_membership(self.current_term, next.clone());
        let index = self.leader_append(entry);

        self.membership = next;
        self.membership_uncommitted_index = index;

        {
            let Volatile::Leader(leader) = &mut self.state else { unreachable!() };
            leader.change = Some(PendingChange { request, index });
            // Track progress for any newly added servers.
            let last_index = self.log.last_index();
            for server in self.membership.servers() {
                if server.id != self.id {
                    leader.progress.entry(server.id).or_insert_with(|| Progress::new(last_index, self.now));
                }
            }
        }
        self.replicate_appended();
    }

    /// Called when a configuration entry commits (leader and follower).
    pub(crate) fn commit_membership(&mut self, index: LogIndex) {
        let Some(entry) = self.log.get(index) else { return };
        let EntryPayload::Membership(m) = &entry.payload else { return };
        let committed = m.clone();

        self.membership_committed = committed.clone();
        self.membership_committed_index = index;
        if self.membership_uncommitted_index == index {
            self.membership_uncommitted_index = 0;
        }
        // The committed entry may be stale relative to a newer
        // uncommitted one; the effective membership only moves forward.
        if self.membership_uncommitted_index == 0 {
            self.membership = committed;
        }

        let mut change_done = None;
        if let Volatile::Leader(leader) = &mut self.state {
            if leader.change.as_ref().map(|c| c.index == index).unwrap_or(false) {
                let change = leader.change.take().expect("checked above");
                change_done = Some(change.request);
            }
        }
        if let Some(request) = change_done {
            self.push_request_done(request, Ok(RequestOutput::empty(index)));
        }

        // A leader that is no longer a voter steps down once the change
        // is safe.
        if matches!(self.state, Volatile::Leader(_)) && !self.membership.is_voter(self.id) {
            tracing::info!(id = self.id, "no longer a voter; stepping down");
            self.become_follower(None);
        }
    }

    /// Restore the previously committed configuration after the entry
    /// carrying an uncommitted one got truncated away.
    pub(crate) fn rollback_membership(&mut self) {
        tracing::info!(
            id = self.id,
            uncommitted = self.membership_uncommitted_index,
            committed = self.membership_committed_index,
            "rolling back uncommitted configuration"
        );
        self.membership = self.membership_committed.clone();
        self.membership_uncommitted_index = 0;
    }

    /// Catch-up bookkeeping: a replication ack from the promotee may
    /// finish the current round.
    pub(crate) fn on_promotee_ack(&mut self, from: NodeId) {
        let Volatile::Leader(leader) = &mut self.state else { return };
        let Some(catch_up) = &mut leader.catch_up else { return };
        if catch_up.promotee != from {
            return;
        }
        let match_index = leader.progress.get(&from).map(|p| p.match_index).unwrap_or(0);
        if match_index < catch_up.round_index {
            return;
        }

        let last_index = self.log.last_index();
        if match_index >= last_index {
            // Fully caught up: commit to the promotion.
            let catch_up = leader.catch_up.take().expect("present");
            tracing::info!(leader = self.id, promotee = from, round = catch_up.round, "catch-up complete");
            let mut next = self.membership.clone();
            next.assign(catch_up.promotee, catch_up.target_role).expect("still a member");
            self.append_membership(next, catch_up.request);
            return;
        }

        if catch_up.round >= self.config.max_catch_up_rounds {
            let catch_up = leader.catch_up.take().expect("present");
            tracing::warn!(leader = self.id, promotee = from, "catch-up exhausted its rounds");
            self.push_request_done(catch_up.request, Err(RaftError::NoConnection));
            return;
        }

        catch_up.round += 1;
        catch_up.round_index = last_index;
        catch_up.round_start = self.now;
        tracing::debug!(leader = self.id, promotee = from, round = catch_up.round, "starting next catch-up round");
    }

    /// Give up on a round that overran its deadline.
    pub(crate) fn tick_catch_up(&mut self, now: Millis) {
        let expired = {
            let Volatile::Leader(leader) = &self.state else { return };
            let Some(catch_up) = &leader.catch_up else { return };
            now.saturating_sub(catch_up.round_start) >= self.config.max_catch_up_round_duration
        };
        if !expired {
            return;
        }
        let Volatile::Leader(leader) = &mut self.state else { return };
        let catch_up = leader.catch_up.take().expect("checked above");
        tracing::warn!(leader = self.id, promotee = catch_up.promotee, round = catch_up.round, "catch-up round timed out");
        self.push_request_done(catch_up.request, Err(RaftError::NoConnection));
    }
}
