//! Leadership transfer.

use crate::core::RaftCore;
use crate::core::RequestId;
use crate::core::TransferState;
use crate::core::Volatile;
use crate::error::RaftError;
use crate::message::Message;
use crate::message::TimeoutNowRequest;
use crate::Millis;
use crate::NodeId;

impl RaftCore {
    /// Hand leadership to `target` (0 picks the most caught-up voter).
    ///
    /// The TimeoutNow goes out as soon as the target's log is complete;
    /// while the transfer is active new proposals are refused with
    /// `not_leader`. The attempt expires after one election timeout.
    pub fn transfer_leadership(&mut self, request: RequestId, target: NodeId, now: Millis) {
        self.now = now;
        if !matches!(self.state, Volatile::Leader(_)) {
            self.push_request_done(request, Err(RaftError::NotLeader));
            return;
        }
        if self.transfer.is_some() {
            self.push_request_done(request, Err(RaftError::Busy));
            return;
        }

        let target = if target != 0 { target } else { self.pick_transfer_target() };
        if target == 0 {
            self.push_request_done(request, Err(RaftError::NotFound));
            return;
        }
        if target == self.id || !self.membership.is_voter(target) {
            self.push_request_done(request, Err(RaftError::BadId));
            return;
        }

        tracing::info!(leader = self.id, target, "starting leadership transfer");
        self.transfer = Some(TransferState { request, target, start: now, timeout_now_sent: false });
        self.maybe_send_timeout_now();
    }

    /// The voter with the highest acknowledged log, or 0 when there is
    /// no usable target.
    fn pick_transfer_target(&self) -> NodeId {
        let Volatile::Leader(leader) = &self.state else { return 0 };
        self.membership
            .voters()
            .filter(|s| s.id != self.id)
            .max_by_key(|s| leader.progress.get(&s.id).map(|p| p.match_index).unwrap_or(0))
            .map(|s| s.id)
            .unwrap_or(0)
    }

    /// A replication ack may complete the target's log and release the
    /// TimeoutNow.
    pub(crate) fn on_transfer_target_ack(&mut self, from: NodeId) {
        let is_target = self.transfer.as_ref().map(|t| t.target == from && !t.timeout_now_sent).unwrap_or(false);
        if is_target {
            self.maybe_send_timeout_now();
        }
    }

    fn maybe_send_timeout_now(&mut self) {
        let Some(transfer) = &self.transfer else { return };
        if transfer.timeout_now_sent {
            return;
        }
        let target = transfer.target;
        let caught_up = {
            let Volatile::Leader(leader) = &self.state else { return };
            leader.progress.get(&target).map(|p| p.match_index >= self.log.last_index()).unwrap_or(false)
        };
        if !caught_up {
            return;
        }

        tracing::info!(leader = self.id, target, "target caught up; sending TimeoutNow");
        let message = Message::TimeoutNow(TimeoutNowRequest {
            version: TimeoutNowRequest::VERSION,
            term: self.current_term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        self.send_message(target, message);
        if let Some(transfer) = &mut self.transfer {
            transfer.timeout_now_sent = true;
        }
    }

    /// Expire a transfer that did not conclude within an election
    /// timeout; the leader resumes normal duty.
    pub(crate) fn tick_transfer(&mut self, now: Millis) {
        let expired = self
            .transfer
            .as_ref()
            .map(|t| now.saturating_sub(t.start) >= self.config.election_timeout)
            .unwrap_or(false);
        if !expired {
            return;
        }
        let transfer = self.transfer.take().expect("checked above");
        tracing::warn!(leader = self.id, target = transfer.target, "leadership transfer expired");
        self.push_request_done(transfer.request, Err(RaftError::NoConnection));
    }
}
