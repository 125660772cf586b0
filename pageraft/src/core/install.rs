//! Glue between the raft core and the snapshot-install sessions.

use crate::core::RaftCore;
use crate::core::Volatile;
use crate::core::WorkOwnerKind;
use crate::message::InstallResult;
use crate::message::InstallSnapshotResponse;
use crate::message::Message;
use crate::snapshot::leader::LeaderTuning;
use crate::snapshot::LeaderSession;
use crate::snapshot::SessionEffect;
use crate::snapshot::SessionInput;
use crate::snapshot::WorkOutput;
use crate::storage::Snapshot;
use crate::Millis;
use crate::NodeId;
use crate::ServerState;

impl RaftCore {
    /// A peer's `next_index` fell behind the snapshot anchor: pause
    /// regular replication and fetch the snapshot to install.
    pub(crate) fn start_install(&mut self, peer: NodeId) {
        let anchor = self.log.snapshot_last_index();
        if anchor == 0 {
            return;
        }
        {
            let Volatile::Leader(leader) = &mut self.state else { return };
            if leader.sessions.contains_key(&peer) {
                return;
            }
            let Some(progress) = leader.progress.get_mut(&peer) else { return };
            if progress.mode == crate::progress::ProgressMode::Snapshot {
                return;
            }
            progress.to_snapshot(anchor);
        }
        tracing::info!(leader = self.id, peer, anchor, "follower is behind the snapshot anchor; starting install");
        self.push_effect(crate::core::Effect::SnapshotGet { peer });
    }

    /// The storage delivered (or failed to deliver) the snapshot needed
    /// for `peer`'s installation.
    pub fn snapshot_got(&mut self, peer: NodeId, snapshot: Option<Snapshot>, now: Millis) {
        self.now = now;
        let wanted = {
            let Volatile::Leader(leader) = &self.state else { return };
            !leader.sessions.contains_key(&peer)
                && leader
                    .progress
                    .get(&peer)
                    .map(|p| p.mode == crate::progress::ProgressMode::Snapshot)
                    .unwrap_or(false)
        };
        if !wanted {
            return;
        }

        let Some(snapshot) = snapshot else {
            // Anchored but not persisted yet; retry through the regular
            // replication path.
            let Volatile::Leader(leader) = &mut self.state else { return };
            if let Some(progress) = leader.progress.get_mut(&peer) {
                progress.to_probe();
            }
            return;
        };

        let tuning = LeaderTuning {
            rpc_timeout: self.config.install_snapshot_timeout,
            sig_wait_interval: self.config.install_snapshot_timeout,
            sig_batch_pages: self.config.signature_batch_pages,
            move_batch_pages: self.config.move_batch_pages,
        };
        let mut session = LeaderSession::new(peer, self.current_term, snapshot, tuning);
        let mut out = Vec::new();
        session.start(&mut out);
        {
            let Volatile::Leader(leader) = &mut self.state else { return };
            leader.sessions.insert(peer, session);
        }
        self.apply_leader_session_effects(peer, out);
    }

    /// Fire the per-session RPC timeouts.
    pub(crate) fn tick_install_sessions(&mut self, now: Millis) {
        let expired: Vec<NodeId> = {
            let Volatile::Leader(leader) = &self.state else { return };
            leader
                .sessions
                .iter()
                .filter(|(_, s)| s.next_deadline().map(|at| now >= at).unwrap_or(false))
                .map(|(id, _)| *id)
                .collect()
        };
        for peer in expired {
            self.leader_session_input(peer, SessionInput::Timeout);
        }
    }

    /// Route an inbound snapshot-install family message.
    pub(crate) fn handle_install_message(&mut self, from: NodeId, message: Message) {
        match &message {
            Message::InstallSnapshot(req) => {
                if req.term < self.current_term {
                    // A deposed leader is driving this session; telling
                    // it `unexpected` makes it reset.
                    self.send_message(
                        from,
                        Message::InstallSnapshotResult(InstallSnapshotResponse {
                            version: InstallSnapshotResponse::VERSION,
                            result: InstallResult::Unexpected,
                        }),
                    );
                    return;
                }
                match self.state.kind() {
                    ServerState::Candidate => self.become_follower(Some(from)),
                    ServerState::Leader => return,
                    ServerState::Unavailable => return,
                    ServerState::Follower => {}
                }
                if let Volatile::Follower(f) = &mut self.state {
                    f.current_leader = Some(from);
                }
                self.election_timer_start = self.now;

                if req.result == InstallResult::Ok && !self.install_follower.is_active() {
                    // Fresh session: capture our current content; its
                    // checksums drive the diff.
                    let pages = self.fsm.snapshot(self.config.page_size);
                    let mut out = Vec::new();
                    self.install_follower.begin(from, pages, req, &mut out);
                    self.apply_follower_session_effects(from, out);
                } else {
                    self.follower_session_input(from, SessionInput::Msg(&message));
                }
            }

            Message::Signature(_) | Message::SnapshotCp(_) | Message::SnapshotMv(_) => {
                // Session traffic counts as leader contact.
                if matches!(self.state, Volatile::Follower(_)) {
                    self.election_timer_start = self.now;
                }
                self.follower_session_input(from, SessionInput::Msg(&message));
            }

            Message::InstallSnapshotResult(_)
            | Message::SignatureResult(_)
            | Message::SnapshotCpResult(_)
            | Message::SnapshotMvResult(_) => {
                self.leader_session_input(from, SessionInput::Msg(&message));
            }

            _ => unreachable!("only install-family messages are routed here"),
        }
    }

    // ------------------------------------------------------------------
    // Leader-side plumbing.

    pub(crate) fn leader_session_input(&mut self, peer: NodeId, input: SessionInput<'_>) {
        let mut out = Vec::new();
        {
            let Volatile::Leader(leader) = &mut self.state else { return };
            let Some(session) = leader.sessions.get_mut(&peer) else { return };
            session.handle(self.now, input, &mut out);
        }
        self.apply_leader_session_effects(peer, out);
    }

    fn apply_leader_session_effects(&mut self, peer: NodeId, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Send(message) => self.send_install_message(peer, message),
                SessionEffect::Work(job) => self.push_work(WorkOwnerKind::LeaderInstall(peer), job),
                SessionEffect::Done => {
                    tracing::info!(leader = self.id, peer, "snapshot installation complete; resuming replication");
                    {
                        let Volatile::Leader(leader) = &mut self.state else { continue };
                        leader.sessions.remove(&peer);
                        if let Some(progress) = leader.progress.get_mut(&peer) {
                            progress.snapshot_done();
                        }
                    }
                    self.send_append(peer);
                }
                SessionEffect::Reset => {
                    tracing::info!(leader = self.id, peer, "snapshot installation reset");
                    let Volatile::Leader(leader) = &mut self.state else { continue };
                    leader.sessions.remove(&peer);
                    if let Some(progress) = leader.progress.get_mut(&peer) {
                        progress.to_probe();
                    }
                }
            }
        }
    }

    pub(crate) fn on_install_send_done(&mut self, peer: NodeId, ok: bool) {
        let input = if ok { SessionInput::MsgSent } else { SessionInput::SendFailed };
        self.leader_session_input(peer, input);
    }

    pub(crate) fn on_install_work_done(&mut self, peer: NodeId, output: WorkOutput) {
        self.leader_session_input(peer, SessionInput::WorkDone(output));
    }

    // ------------------------------------------------------------------
    // Follower-side plumbing.

    /// `reply_to` is where replies produced by this input go; the session
    /// may have already forgotten its peer by the time it answers (an
    /// `unexpected` reply resets it on the spot).
    pub(crate) fn follower_session_input(&mut self, reply_to: NodeId, input: SessionInput<'_>) {
        let mut out = Vec::new();
        self.install_follower.handle(input, &mut out);
        self.apply_follower_session_effects(reply_to, out);
    }

    fn apply_follower_session_effects(&mut self, reply_to: NodeId, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Send(message) => {
                    if reply_to != 0 {
                        self.send_follower_install_message(reply_to, message);
                    }
                }
                SessionEffect::Work(job) => self.push_work(WorkOwnerKind::FollowerInstall, job),
                SessionEffect::Done => {
                    if let Some(snapshot) = self.install_follower.take_installed() {
                        self.install_received_snapshot(snapshot);
                    }
                }
                SessionEffect::Reset => {}
            }
        }
    }

    pub(crate) fn on_follower_install_send_done(&mut self, ok: bool) {
        let reply_to = self.install_follower.leader();
        let input = if ok { SessionInput::MsgSent } else { SessionInput::SendFailed };
        self.follower_session_input(reply_to, input);
    }

    pub(crate) fn on_follower_install_work_done(&mut self, output: WorkOutput) {
        let reply_to = self.install_follower.leader();
        self.follower_session_input(reply_to, SessionInput::WorkDone(output));
    }
}
