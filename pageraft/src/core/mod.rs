//! The deterministic raft core.
//!
//! [`RaftCore`] is a sans-IO state machine: every input is an explicit
//! event (a clock tick, an inbound message, a storage or background-work
//! completion, a send confirmation, or an API request) and every output
//! is an [`Effect`] collected through [`RaftCore::take_effects`]. The
//! core never blocks and owns the log, the configuration and the
//! replication progress exclusively; collaborators only ever see copies.

mod change;
mod election;
mod install;
mod replication;
mod transfer;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::config::Config;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::NetworkError;
use crate::error::RaftError;
use crate::error::StorageError;
use crate::log::LogStore;
use crate::membership::Membership;
use crate::membership::Role;
use crate::message::Message;
use crate::metrics::RaftMetrics;
use crate::metrics::ReplicationMetrics;
use crate::progress::Progress;
use crate::snapshot::FollowerSession;
use crate::snapshot::LeaderSession;
use crate::snapshot::WorkJob;
use crate::snapshot::WorkOutput;
use crate::state_machine::StateMachine;
use crate::storage::InitialState;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::LogId;
use crate::LogIndex;
use crate::Millis;
use crate::NodeId;
use crate::ServerState;
use crate::Term;

/// Caller-chosen identifier correlating an API call with its completion.
pub type RequestId = u64;

/// Completion payload of a successful request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestOutput {
    /// Log index the request was decided at, zero for requests that do
    /// not append an entry (e.g. leadership transfer).
    pub index: LogIndex,
    /// State-machine response for commands; empty otherwise.
    pub response: Bytes,
}

impl RequestOutput {
    pub(crate) fn empty(index: LogIndex) -> Self {
        RequestOutput { index, response: Bytes::new() }
    }
}

/// An instruction to the driver. Effects must be performed in order;
/// completions are reported back through the corresponding `*_done`
/// event.
#[derive(Debug)]
pub enum Effect {
    /// Hand a message to the transport. Report the outcome with
    /// [`RaftCore::send_done`].
    Send { id: u64, to: NodeId, to_address: String, message: Message },

    /// Persist entries. Completions arrive in submission order through
    /// [`RaftCore::append_done`].
    Append { first_index: LogIndex, entries: Vec<Entry> },

    /// Remove persisted entries with index >= `from`.
    Truncate { from: LogIndex },

    /// Persist the current term. Must be durable before any subsequent
    /// `Send` effect is performed.
    SetTerm { term: Term },

    /// Persist the vote. Same durability rule as `SetTerm`.
    SetVote { voted_for: Option<NodeId> },

    /// Persist a snapshot; report with [`RaftCore::snapshot_put_done`].
    SnapshotPut { trailing: u64, snapshot: Snapshot },

    /// Fetch the latest snapshot for an install session; report with
    /// [`RaftCore::snapshot_got`].
    SnapshotGet { peer: NodeId },

    /// Run a background job (worker pool); report with
    /// [`RaftCore::work_done`].
    StartWork { id: u64, job: WorkJob },

    /// Complete an API request.
    RequestDone { request: RequestId, result: Result<RequestOutput, RaftError> },

    /// The server changed role.
    StateChange { from: ServerState, to: ServerState },
}

/// Why a send was issued; consulted when its completion arrives.
#[derive(Debug)]
enum SendInterest {
    /// Nothing depends on the outcome.
    None,
    /// An AppendEntries to `peer`, holding `acquired` log references
    /// until the transport is done with the buffers.
    Append { peer: NodeId, first_index: LogIndex, acquired: Vec<Entry> },
    /// A leader-side snapshot-install message to `peer`.
    Install { peer: NodeId },
    /// A follower-side snapshot-install reply.
    FollowerInstall,
}

#[derive(Debug)]
enum WorkOwner {
    LeaderInstall { peer: NodeId },
    FollowerInstall,
}

/// A locally initiated append, awaiting its storage completion.
#[derive(Debug)]
struct AppendCtx {
    first_index: LogIndex,
    last_index: LogIndex,
    /// Leader to acknowledge once the entries are durable; `None` for
    /// the leader's own appends.
    reply_to: Option<NodeId>,
}

#[derive(Debug)]
pub(crate) struct FollowerVolatile {
    pub randomized_election_timeout: Millis,
    pub current_leader: Option<NodeId>,
}

#[derive(Debug)]
pub(crate) struct CandidateVolatile {
    pub randomized_election_timeout: Millis,
    /// Servers that granted this round, self included.
    pub votes: std::collections::BTreeSet<NodeId>,
    pub in_pre_vote: bool,
    pub disrupt_leader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Write,
    Barrier,
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub index: LogIndex,
    pub request: RequestId,
    pub kind: RequestKind,
}

/// A membership change whose configuration entry is waiting to commit.
#[derive(Debug)]
pub(crate) struct PendingChange {
    pub request: RequestId,
    pub index: LogIndex,
}

/// The replication rounds catching a promotee up before its promotion is
/// appended.
#[derive(Debug)]
pub(crate) struct CatchUp {
    pub request: RequestId,
    pub promotee: NodeId,
    pub target_role: Role,
    pub round: u16,
    pub round_index: LogIndex,
    pub round_start: Millis,
}

pub(crate) struct LeaderVolatile {
    pub progress: BTreeMap<NodeId, Progress>,
    pub requests: VecDeque<PendingRequest>,
    pub change: Option<PendingChange>,
    pub catch_up: Option<CatchUp>,
    pub sessions: BTreeMap<NodeId, LeaderSession>,
}

pub(crate) enum Volatile {
    Unavailable,
    Follower(FollowerVolatile),
    Candidate(CandidateVolatile),
    Leader(LeaderVolatile),
}

impl Volatile {
    fn kind(&self) -> ServerState {
        match self {
            Volatile::Unavailable => ServerState::Unavailable,
            Volatile::Follower(_) => ServerState::Follower,
            Volatile::Candidate(_) => ServerState::Candidate,
            Volatile::Leader(_) => ServerState::Leader,
        }
    }
}

/// An in-progress leadership transfer.
#[derive(Debug)]
pub(crate) struct TransferState {
    pub request: RequestId,
    pub target: NodeId,
    pub start: Millis,
    pub timeout_now_sent: bool,
}

/// Hold and drive the state of a single raft server in a cluster.
pub struct RaftCore {
    pub(crate) id: NodeId,
    pub(crate) address: String,
    pub(crate) config: Config,
    fsm: Box<dyn StateMachine>,
    rng: StdRng,

    // Cache of the persistent state, updated on stable storage before
    // replying to RPCs.
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: LogStore,

    // Effective configuration plus the committed/uncommitted bookkeeping.
    pub(crate) membership: Membership,
    pub(crate) membership_committed: Membership,
    pub(crate) membership_committed_index: LogIndex,
    pub(crate) membership_uncommitted_index: LogIndex,
    pub(crate) membership_last_snapshot: Option<(Membership, LogIndex)>,

    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) last_stored: LogIndex,

    pub(crate) state: Volatile,
    pub(crate) election_timer_start: Millis,
    pub(crate) now: Millis,

    pub(crate) transfer: Option<TransferState>,
    pub(crate) install_follower: FollowerSession,

    /// A snapshot_put is outstanding; at most one at a time.
    snapshot_put_pending: bool,
    /// Anchor to apply to the volatile log when the put completes.
    pending_snapshot_anchor: Option<(LogIndex, u64)>,

    append_queue: VecDeque<AppendCtx>,
    send_interest: HashMap<u64, SendInterest>,
    work_owner: HashMap<u64, WorkOwner>,
    next_send_id: u64,
    next_work_id: u64,

    started: bool,
    shutting_down: bool,

    effects: Vec<Effect>,
}

impl RaftCore {
    pub fn new(id: NodeId, address: &str, config: Config, fsm: Box<dyn StateMachine>, seed: u64) -> Self {
        let sig_batch = config.signature_batch_pages;
        RaftCore {
            id,
            address: address.to_string(),
            config,
            fsm,
            rng: StdRng::seed_from_u64(seed),
            current_term: 0,
            voted_for: None,
            log: LogStore::new(),
            membership: Membership::new(),
            membership_committed: Membership::new(),
            membership_committed_index: 0,
            membership_uncommitted_index: 0,
            membership_last_snapshot: None,
            commit_index: 0,
            last_applied: 0,
            last_stored: 0,
            state: Volatile::Unavailable,
            election_timer_start: 0,
            now: 0,
            transfer: None,
            install_follower: FollowerSession::idle(sig_batch),
            snapshot_put_pending: false,
            pending_snapshot_anchor: None,
            append_queue: VecDeque::new(),
            send_interest: HashMap::new(),
            work_owner: HashMap::new(),
            next_send_id: 1,
            next_work_id: 1,
            started: false,
            shutting_down: false,
            effects: Vec::new(),
        }
    }

    /// Resume from persisted state and become follower.
    pub fn start(&mut self, state: InitialState, now: Millis) {
        assert!(!self.started, "core already started");
        self.now = now;
        self.current_term = state.term;
        self.voted_for = state.voted_for;

        let mut snapshot_anchor = None;
        if let Some(snapshot) = state.snapshot {
            snapshot_anchor = Some((snapshot.meta.last_log_id.index, snapshot.meta.last_log_id.term));
            self.commit_index = snapshot.meta.last_log_id.index;
            self.last_applied = snapshot.meta.last_log_id.index;
            self.membership = snapshot.meta.membership.clone();
            self.membership_committed = snapshot.meta.membership.clone();
            self.membership_committed_index = snapshot.meta.membership_index;
            self.membership_last_snapshot = Some((snapshot.meta.membership.clone(), snapshot.meta.membership_index));
            self.fsm.restore(&snapshot.pages);
        }

        self.log = LogStore::load(snapshot_anchor, state.start_index, state.entries);
        self.last_stored = self.log.last_index();

        // Recover the configuration from the entries following the
        // snapshot. The last one is effective; it counts as committed
        // only if its index is covered by the snapshot anchor.
        let first = self.log.first_index();
        if first > 0 {
            for index in first..=self.log.last_index() {
                let entry = self.log.get(index).expect("entry in range");
                if let EntryPayload::Membership(m) = &entry.payload {
                    self.membership = m.clone();
                    if index <= self.commit_index {
                        self.membership_committed = m.clone();
                        self.membership_committed_index = index;
                        self.membership_uncommitted_index = 0;
                    } else {
                        self.membership_uncommitted_index = index;
                    }
                }
            }
        }

        self.started = true;
        self.become_follower(None);
        tracing::info!(
            id = self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            servers = self.membership.len(),
            "server started"
        );
    }

    /// Advance timers. The driver calls this at a fixed cadence (the
    /// fixture every simulated millisecond).
    pub fn tick(&mut self, now: Millis) {
        if !self.started || self.shutting_down {
            return;
        }
        self.now = now;

        match self.state.kind() {
            ServerState::Follower => self.tick_follower(now),
            ServerState::Candidate => self.tick_candidate(now),
            ServerState::Leader => self.tick_leader(now),
            ServerState::Unavailable => {}
        }

        self.maybe_take_snapshot();
    }

    fn tick_follower(&mut self, now: Millis) {
        let Volatile::Follower(f) = &self.state else { return };
        let timeout = f.randomized_election_timeout;
        if now.saturating_sub(self.election_timer_start) < timeout {
            return;
        }
        if !self.membership.is_voter(self.id) {
            return;
        }
        // Never start an election while local entries are still being
        // persisted: the vote predicate must see our final log.
        if self.appends_in_flight() > 0 {
            return;
        }
        tracing::debug!(id = self.id, term = self.current_term, "election timeout; converting to candidate");
        self.convert_to_candidate(false);
    }

    fn tick_candidate(&mut self, now: Millis) {
        let Volatile::Candidate(c) = &self.state else { return };
        if now.saturating_sub(self.election_timer_start) >= c.randomized_election_timeout {
            tracing::debug!(id = self.id, term = self.current_term, "election round expired; starting another");
            self.convert_to_candidate(false);
        }
    }

    /// Events owned by the public API.
    ///
    /// Propose an application command. Completes through
    /// `Effect::RequestDone` once the command is committed and applied.
    pub fn client_write(&mut self, request: RequestId, data: Bytes, now: Millis) {
        self.now = now;
        if let Err(err) = self.accepting_proposals() {
            self.push_request_done(request, Err(err));
            return;
        }
        let mut entry = Entry::new_command(self.current_term, data);
        entry.is_local = true;
        let index = self.leader_append(entry);
        let Volatile::Leader(leader) = &mut self.state else { unreachable!() };
        leader.requests.push_back(PendingRequest { index, request, kind: RequestKind::Write });
        self.replicate_appended();
    }

    /// Propose a barrier: completes once every earlier entry is applied.
    pub fn barrier(&mut self, request: RequestId, now: Millis) {
        self.now = now;
        if let Err(err) = self.accepting_proposals() {
            self.push_request_done(request, Err(err));
            return;
        }
        let index = self.leader_append(Entry::new_barrier(self.current_term));
        let Volatile::Leader(leader) = &mut self.state else { unreachable!() };
        leader.requests.push_back(PendingRequest { index, request, kind: RequestKind::Barrier });
        self.replicate_appended();
    }

    /// Refuse proposals unless this server is a leader not currently
    /// handing leadership over.
    pub(crate) fn accepting_proposals(&self) -> Result<(), RaftError> {
        if self.shutting_down {
            return Err(RaftError::Shutdown);
        }
        if !matches!(self.state, Volatile::Leader(_)) || self.transfer.is_some() {
            return Err(RaftError::NotLeader);
        }
        Ok(())
    }

    /// An inbound message from `from`.
    pub fn step(&mut self, from: NodeId, message: Message, now: Millis) {
        if !self.started || self.shutting_down {
            return;
        }
        self.now = now;

        // Discovering a higher term makes anyone a follower, with the
        // exception of pre-vote requests, which must not disturb terms.
        if let Some(term) = message.term() {
            let is_pre_vote_request = matches!(&message, Message::RequestVote(r) if r.pre_vote);
            if term > self.current_term && !is_pre_vote_request {
                self.bump_term(term);
            }
        }

        match message {
            Message::AppendEntries(req) => self.handle_append_entries(from, req),
            Message::AppendEntriesResult(res) => self.handle_append_entries_result(from, res),
            Message::RequestVote(req) => self.handle_request_vote(from, req),
            Message::RequestVoteResult(res) => self.handle_request_vote_result(from, res),
            Message::TimeoutNow(req) => self.handle_timeout_now(from, req),
            other => self.handle_install_message(from, other),
        }
    }

    /// Completion of the oldest outstanding storage append.
    pub fn append_done(&mut self, result: Result<(), StorageError>, now: Millis) {
        self.now = now;
        let Some(ctx) = self.append_queue.pop_front() else {
            debug_assert!(self.shutting_down, "append completion without a pending append");
            return;
        };

        match result {
            Ok(()) => {
                self.last_stored = self.last_stored.max(ctx.last_index);
                if let Some(leader_id) = ctx.reply_to {
                    self.send_append_ack(leader_id);
                }
                if matches!(self.state, Volatile::Leader(_)) {
                    self.maybe_advance_commit();
                }
            }
            Err(err) => {
                tracing::warn!(id = self.id, first = ctx.first_index, error = %err, "local append failed");
                if matches!(err, StorageError::Corrupt(_)) {
                    self.become_unavailable();
                }
                // Otherwise drop the ack; the leader retries.
            }
        }
    }

    /// Completion of an outstanding snapshot_put.
    pub fn snapshot_put_done(&mut self, result: Result<(), StorageError>, now: Millis) {
        self.now = now;
        self.snapshot_put_pending = false;
        let anchor = self.pending_snapshot_anchor.take();
        match result {
            Ok(()) => {
                if let Some((last_index, trailing)) = anchor {
                    if let Err(err) = self.log.snapshot(last_index, trailing) {
                        tracing::warn!(id = self.id, last_index, "snapshot anchor rejected: {err}");
                    } else {
                        self.membership_last_snapshot =
                            Some((self.membership_committed.clone(), self.membership_committed_index));
                    }
                }
            }
            Err(err) => {
                tracing::warn!(id = self.id, error = %err, "snapshot_put failed; will retry");
            }
        }
    }

    /// Confirmation (or failure) of a previously emitted `Send`.
    pub fn send_done(&mut self, id: u64, result: Result<(), NetworkError>, now: Millis) {
        self.now = now;
        let Some(interest) = self.send_interest.remove(&id) else { return };
        match interest {
            SendInterest::None => {}
            SendInterest::Append { peer, first_index, acquired } => {
                self.log.release(first_index, &acquired);
                if result.is_err() {
                    self.on_append_send_failed(peer);
                }
            }
            SendInterest::Install { peer } => self.on_install_send_done(peer, result.is_ok()),
            SendInterest::FollowerInstall => self.on_follower_install_send_done(result.is_ok()),
        }
    }

    /// Completion of a background job.
    pub fn work_done(&mut self, id: u64, output: WorkOutput, now: Millis) {
        self.now = now;
        let Some(owner) = self.work_owner.remove(&id) else { return };
        match owner {
            WorkOwner::LeaderInstall { peer } => self.on_install_work_done(peer, output),
            WorkOwner::FollowerInstall => self.on_follower_install_work_done(output),
        }
    }

    /// The storage can no longer uphold term/vote durability; safety is
    /// gone and the server stops participating.
    pub fn fatal_storage(&mut self) {
        self.become_unavailable();
    }

    /// Cancel everything in flight and go unavailable. Pending requests
    /// complete with `shutdown`.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.fail_leader_requests(RaftError::Shutdown);
        if let Some(transfer) = self.transfer.take() {
            self.push_request_done(transfer.request, Err(RaftError::Shutdown));
        }
        let from = self.state.kind();
        self.state = Volatile::Unavailable;
        if from != ServerState::Unavailable {
            self.effects.push(Effect::StateChange { from, to: ServerState::Unavailable });
        }
        tracing::info!(id = self.id, "server shut down");
    }

    /// Drain the effects produced by the events handled so far.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    // ------------------------------------------------------------------
    // Accessors.

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ServerState {
        self.state.kind()
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_stored(&self) -> LogIndex {
        self.last_stored
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn membership_committed_index(&self) -> LogIndex {
        self.membership_committed_index
    }

    pub fn membership_uncommitted_index(&self) -> LogIndex {
        self.membership_uncommitted_index
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    /// The leader this server currently acknowledges, itself included.
    pub fn current_leader(&self) -> Option<NodeId> {
        match &self.state {
            Volatile::Leader(_) => Some(self.id),
            Volatile::Follower(f) => f.current_leader,
            _ => None,
        }
    }

    /// Count of voters (self included) heard from within the last
    /// election timeout. Only meaningful on a leader.
    pub fn voter_contacts(&self) -> usize {
        let Volatile::Leader(leader) = &self.state else { return 0 };
        let mut contacts = usize::from(self.membership.is_voter(self.id));
        for server in self.membership.voters() {
            if server.id == self.id {
                continue;
            }
            if let Some(progress) = leader.progress.get(&server.id) {
                if self.now.saturating_sub(progress.last_recv) <= self.config.election_timeout {
                    contacts += 1;
                }
            }
        }
        contacts
    }

    /// A point-in-time metrics snapshot.
    pub fn metrics(&self) -> RaftMetrics {
        let replication = match &self.state {
            Volatile::Leader(leader) => {
                leader.progress.iter().map(|(id, p)| (*id, ReplicationMetrics { match_index: p.match_index })).collect()
            }
            _ => BTreeMap::new(),
        };
        RaftMetrics {
            id: self.id,
            state: self.state.kind(),
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            last_applied: self.last_applied,
            commit_index: self.commit_index,
            current_leader: self.current_leader(),
            voter_contacts: self.voter_contacts(),
            membership: self.membership.clone(),
            replication,
        }
    }

    // ------------------------------------------------------------------
    // Internal plumbing shared by the handler modules.

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn push_request_done(&mut self, request: RequestId, result: Result<RequestOutput, RaftError>) {
        self.effects.push(Effect::RequestDone { request, result });
    }

    /// Queue a message send, remembering why we care about its outcome.
    fn push_send(&mut self, to: NodeId, message: Message, interest: SendInterest) {
        let id = self.next_send_id;
        self.next_send_id += 1;
        let to_address = self.membership.get(to).map(|s| s.address.clone()).unwrap_or_default();
        self.send_interest.insert(id, interest);
        self.effects.push(Effect::Send { id, to, to_address, message });
    }

    pub(crate) fn send_message(&mut self, to: NodeId, message: Message) {
        self.push_send(to, message, SendInterest::None);
    }

    pub(crate) fn send_append_message(&mut self, to: NodeId, first_index: LogIndex, acquired: Vec<Entry>, message: Message) {
        self.push_send(to, message, SendInterest::Append { peer: to, first_index, acquired });
    }

    pub(crate) fn send_install_message(&mut self, to: NodeId, message: Message) {
        self.push_send(to, message, SendInterest::Install { peer: to });
    }

    pub(crate) fn send_follower_install_message(&mut self, to: NodeId, message: Message) {
        self.push_send(to, message, SendInterest::FollowerInstall);
    }

    pub(crate) fn push_work(&mut self, owner: WorkOwnerKind, job: WorkJob) {
        let id = self.next_work_id;
        self.next_work_id += 1;
        let owner = match owner {
            WorkOwnerKind::LeaderInstall(peer) => WorkOwner::LeaderInstall { peer },
            WorkOwnerKind::FollowerInstall => WorkOwner::FollowerInstall,
        };
        self.work_owner.insert(id, owner);
        self.effects.push(Effect::StartWork { id, job });
    }

    /// Append an entry locally as leader: volatile log plus the durable
    /// append request.
    pub(crate) fn leader_append(&mut self, entry: Entry) -> LogIndex {
        let index = self.log.append(entry.clone());
        self.append_queue.push_back(AppendCtx { first_index: index, last_index: index, reply_to: None });
        self.effects.push(Effect::Append { first_index: index, entries: vec![entry] });
        index
    }

    /// Follower-side append of replicated entries; the ack goes out when
    /// the entries are durable.
    pub(crate) fn follower_append(&mut self, leader: NodeId, first_index: LogIndex, entries: Vec<Entry>) {
        let last_index = first_index + entries.len() as LogIndex - 1;
        self.append_queue.push_back(AppendCtx { first_index, last_index, reply_to: Some(leader) });
        self.effects.push(Effect::Append { first_index, entries });
    }

    pub(crate) fn appends_in_flight(&self) -> usize {
        self.append_queue.len()
    }

    /// Persist a newly discovered term and drop to follower.
    pub(crate) fn bump_term(&mut self, term: Term) {
        debug_assert!(term > self.current_term);
        tracing::debug!(id = self.id, old = self.current_term, new = term, "term advanced");
        self.current_term = term;
        self.voted_for = None;
        self.effects.push(Effect::SetTerm { term });
        self.effects.push(Effect::SetVote { voted_for: None });

        match self.state.kind() {
            ServerState::Leader | ServerState::Candidate => {
                // A transfer that ends with someone else's election is a
                // success; any other demotion fails it.
                if let Some(transfer) = self.transfer.take() {
                    if transfer.timeout_now_sent {
                        self.push_request_done(transfer.request, Ok(RequestOutput::empty(0)));
                    } else {
                        self.push_request_done(transfer.request, Err(RaftError::LeadershipLost));
                    }
                }
                self.become_follower(None);
            }
            _ => {}
        }
    }

    /// Become follower, optionally already knowing the leader.
    pub(crate) fn become_follower(&mut self, leader: Option<NodeId>) {
        let from = self.state.kind();
        self.fail_leader_requests(RaftError::LeadershipLost);
        if from != ServerState::Follower {
            if let Some(transfer) = self.transfer.take() {
                self.push_request_done(transfer.request, Err(RaftError::LeadershipLost));
            }
        }
        let timeout = self.randomized_election_timeout();
        self.state = Volatile::Follower(FollowerVolatile { randomized_election_timeout: timeout, current_leader: leader });
        self.election_timer_start = self.now;
        if from != ServerState::Follower {
            tracing::info!(id = self.id, term = self.current_term, "converted to follower");
            self.effects.push(Effect::StateChange { from, to: ServerState::Follower });
        }
    }

    pub(crate) fn become_unavailable(&mut self) {
        let from = self.state.kind();
        self.fail_leader_requests(RaftError::Shutdown);
        self.state = Volatile::Unavailable;
        if from != ServerState::Unavailable {
            tracing::error!(id = self.id, "fatal storage failure; server is now unavailable");
            self.effects.push(Effect::StateChange { from, to: ServerState::Unavailable });
        }
    }

    /// Fail every queued client request and pending change.
    fn fail_leader_requests(&mut self, err: RaftError) {
        let Volatile::Leader(leader) = &mut self.state else { return };
        let mut done = Vec::new();
        for request in leader.requests.drain(..) {
            done.push(request.request);
        }
        if let Some(change) = leader.change.take() {
            done.push(change.request);
        }
        if let Some(catch_up) = leader.catch_up.take() {
            done.push(catch_up.request);
        }
        for request in done {
            self.effects.push(Effect::RequestDone { request, result: Err(err.clone()) });
        }
    }

    pub(crate) fn randomized_election_timeout(&mut self) -> Millis {
        let base = self.config.election_timeout;
        self.rng.gen_range(base..2 * base)
    }

    // ------------------------------------------------------------------
    // Commit & apply.

    /// Apply entries up to the commit index and complete the client
    /// requests decided by them.
    pub(crate) fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index) else {
                // The entry sits below the retained range; a restored
                // snapshot already covered it.
                self.last_applied = index;
                continue;
            };
            let entry = entry.clone();
            let response = match &entry.payload {
                EntryPayload::Command(_) => self.fsm.apply(index, &entry),
                EntryPayload::Barrier => Bytes::new(),
                EntryPayload::Membership(_) => {
                    self.commit_membership(index);
                    Bytes::new()
                }
            };
            self.last_applied = index;
            self.complete_requests_at(index, response);
        }
    }

    fn complete_requests_at(&mut self, index: LogIndex, response: Bytes) {
        let Volatile::Leader(leader) = &mut self.state else { return };
        let mut done = Vec::new();
        while let Some(front) = leader.requests.front() {
            if front.index > index {
                break;
            }
            let request = leader.requests.pop_front().expect("front exists");
            let output = match request.kind {
                RequestKind::Write => RequestOutput { index: request.index, response: response.clone() },
                RequestKind::Barrier => RequestOutput::empty(request.index),
            };
            done.push((request.request, output));
        }
        for (request, output) in done {
            self.push_request_done(request, Ok(output));
        }
    }

    // ------------------------------------------------------------------
    // Snapshot taking.

    /// Capture and persist a snapshot once enough entries were applied.
    fn maybe_take_snapshot(&mut self) {
        if self.snapshot_put_pending {
            return;
        }
        if self.last_applied.saturating_sub(self.log.snapshot_last_index()) < self.config.snapshot_threshold {
            return;
        }
        // The snapshot carries the committed configuration only.
        if self.last_applied < self.membership_committed_index {
            return;
        }
        let last_index = self.last_applied;
        let last_term = self.log.term_of(last_index);
        if last_term == 0 {
            return;
        }
        tracing::info!(id = self.id, last_index, "taking snapshot");
        let pages = self.fsm.snapshot(self.config.page_size);
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_log_id: LogId::new(last_term, last_index),
                membership: self.membership_committed.clone(),
                membership_index: self.membership_committed_index,
            },
            pages,
        };
        self.snapshot_put_pending = true;
        self.pending_snapshot_anchor = Some((last_index, self.config.snapshot_trailing));
        self.effects.push(Effect::SnapshotPut { trailing: self.config.snapshot_trailing, snapshot });
    }

    /// Install a snapshot assembled by the follower-side session.
    pub(crate) fn install_received_snapshot(&mut self, snapshot: Snapshot) {
        let last = snapshot.meta.last_log_id;
        tracing::info!(id = self.id, last_index = last.index, last_term = last.term, "installing received snapshot");

        self.fsm.restore(&snapshot.pages);
        self.log.restore(last.index, last.term);
        self.commit_index = self.commit_index.max(last.index);
        self.last_applied = last.index;
        self.last_stored = last.index;

        self.membership = snapshot.meta.membership.clone();
        self.membership_committed = snapshot.meta.membership.clone();
        self.membership_committed_index = snapshot.meta.membership_index;
        self.membership_uncommitted_index = 0;
        self.membership_last_snapshot = Some((snapshot.meta.membership.clone(), snapshot.meta.membership_index));

        self.snapshot_put_pending = true;
        self.pending_snapshot_anchor = None;
        self.effects.push(Effect::SnapshotPut { trailing: 0, snapshot });
    }
}

/// Public-facing tag for [`RaftCore::push_work`] owners, avoiding the
/// private `WorkOwner` in module signatures.
pub(crate) enum WorkOwnerKind {
    LeaderInstall(NodeId),
    FollowerInstall,
}

/// Build the initial state a pristine server has right after bootstrap:
/// one configuration entry at index 1, term 1.
pub fn bootstrap_state(membership: Membership) -> InitialState {
    InitialState {
        term: 1,
        voted_for: None,
        snapshot: None,
        start_index: 1,
        entries: vec![Entry::new_membership(1, membership)],
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::snapshot::PageSet;

    struct EchoFsm;

    impl StateMachine for EchoFsm {
        fn apply(&mut self, _index: LogIndex, entry: &Entry) -> Bytes {
            match &entry.payload {
                EntryPayload::Command(data) => data.clone(),
                _ => Bytes::new(),
            }
        }

        fn snapshot(&self, page_size: u32) -> PageSet {
            PageSet::new(page_size)
        }

        fn restore(&mut self, _pages: &PageSet) {}
    }

    fn single_voter_core() -> RaftCore {
        let mut membership = Membership::new();
        membership.add(1, "addr-1", Role::Voter).unwrap();
        let mut core = RaftCore::new(1, "addr-1", Config::default(), Box::new(EchoFsm), 7);
        core.start(bootstrap_state(membership), 0);
        core
    }

    /// Acknowledge every Append effect, returning the rest.
    fn complete_appends(core: &mut RaftCore, now: Millis) -> Vec<Effect> {
        let effects = core.take_effects();
        let n = effects.iter().filter(|e| matches!(e, Effect::Append { .. })).count();
        for _ in 0..n {
            core.append_done(Ok(()), now);
        }
        effects
    }

    fn make_leader(core: &mut RaftCore) -> Millis {
        let mut now = 0;
        while core.state() != ServerState::Leader {
            now += 1;
            assert!(now < 3000, "single voter did not elect itself");
            core.tick(now);
        }
        complete_appends(core, now);
        complete_appends(core, now);
        now
    }

    #[test]
    fn single_voter_elects_itself() {
        let mut core = single_voter_core();
        assert_eq!(core.state(), ServerState::Follower);

        let now = make_leader(&mut core);
        assert_eq!(core.state(), ServerState::Leader);
        assert_eq!(core.current_term(), 2);

        // The election barrier committed, which also committed the
        // bootstrap configuration.
        core.tick(now + 1);
        assert_eq!(core.commit_index(), 2);
        assert_eq!(core.last_applied(), 2);
        assert_eq!(core.membership_committed_index(), 1);
    }

    #[test]
    fn followers_refuse_proposals() {
        let mut core = single_voter_core();
        core.client_write(9, Bytes::from_static(b"nope"), 0);
        let effects = core.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::RequestDone { request: 9, result: Err(RaftError::NotLeader) }
        )));
    }

    #[test]
    fn client_write_commits_and_echoes() {
        let mut core = single_voter_core();
        let now = make_leader(&mut core);

        core.client_write(5, Bytes::from_static(b"hello"), now);
        let effects = complete_appends(&mut core, now);
        assert!(effects.iter().any(|e| matches!(e, Effect::Append { .. })));

        let effects = core.take_effects();
        let done = effects
            .iter()
            .find_map(|e| match e {
                Effect::RequestDone { request: 5, result } => Some(result),
                _ => None,
            })
            .expect("request completed");
        let output = done.as_ref().expect("write succeeded");
        assert_eq!(output.index, 3);
        assert_eq!(&output.response[..], b"hello");
    }

    #[test]
    fn stale_term_append_entries_is_rejected() {
        let mut core = single_voter_core();
        let now = make_leader(&mut core);

        core.step(
            2,
            Message::AppendEntries(crate::message::AppendEntriesRequest {
                version: 0,
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
                entries: vec![],
            }),
            now,
        );
        let effects = core.take_effects();
        let rejected = effects.iter().any(|e| match e {
            Effect::Send { message: Message::AppendEntriesResult(res), .. } => res.rejected != 0,
            _ => false,
        });
        assert!(rejected);
        assert_eq!(core.state(), ServerState::Leader, "a stale leader cannot depose us");
    }

    #[test]
    fn shutdown_fails_pending_requests() {
        let mut core = single_voter_core();
        let now = make_leader(&mut core);

        // Proposal appended but never acknowledged by storage.
        core.client_write(5, Bytes::from_static(b"in flight"), now);
        core.take_effects();

        core.shutdown();
        let effects = core.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::RequestDone { request: 5, result: Err(RaftError::Shutdown) }
        )));
        assert_eq!(core.state(), ServerState::Unavailable);
    }
}
