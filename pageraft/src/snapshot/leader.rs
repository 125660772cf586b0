//! Leader side of the snapshot-install protocol.

use std::collections::VecDeque;

use crate::message::InstallResult;
use crate::message::InstallSnapshotRequest;
use crate::message::Message;
use crate::message::PageChecksum;
use crate::message::PageMove;
use crate::message::PageRange;
use crate::message::SignatureRequest;
use crate::message::SnapshotCpRequest;
use crate::message::SnapshotMvRequest;
use crate::snapshot::ChecksumTable;
use crate::snapshot::ChunkPayload;
use crate::snapshot::SessionEffect;
use crate::snapshot::SessionInput;
use crate::snapshot::WorkJob;
use crate::snapshot::WorkOutput;
use crate::storage::Snapshot;
use crate::Millis;
use crate::NodeId;
use crate::PageNo;
use crate::Term;

/// States of the leader-side machine, one per protocol phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderStage {
    /// The peer is healthy; AppendEntries is sufficient.
    Online,
    /// Checksum table being created in the background.
    HtWait,
    /// InstallSnapshot sent, waiting for the follower to acknowledge.
    NeedsSnapshot,
    /// Probing whether the follower finished computing its checksums.
    CheckSigs,
    /// Follower still calculating; back off before probing again.
    WaitSigs,
    /// Requesting one checksum range.
    RequestSigLoop,
    /// A checksum batch arrived; persisting it.
    ReceivedSigPart,
    /// Batch persisted; more ranges or on to page shipping.
    PersistedSigPart,
    /// Walking the snapshot pages.
    ReadPagesLoop,
    /// One page read and checksummed in the background.
    PageRead,
    /// A Cp or Mv is in flight.
    PageSent,
    /// All pages shipped; closing the installation.
    SnapshotDone,
    Final,
}

/// The single source of truth for legal moves; checked on every
/// transition.
fn allowed(from: LeaderStage) -> &'static [LeaderStage] {
    use LeaderStage::*;
    match from {
        Online => &[HtWait, Online],
        HtWait => &[NeedsSnapshot, Online],
        NeedsSnapshot => &[NeedsSnapshot, CheckSigs, Online],
        CheckSigs => &[CheckSigs, WaitSigs, Online],
        WaitSigs => &[CheckSigs, RequestSigLoop, Online],
        RequestSigLoop => &[RequestSigLoop, ReceivedSigPart, Online],
        ReceivedSigPart => &[PersistedSigPart, RequestSigLoop, Online],
        PersistedSigPart => &[ReadPagesLoop, RequestSigLoop, Online],
        ReadPagesLoop => &[PageRead, PageSent, SnapshotDone, Online],
        PageRead => &[PageSent, ReadPagesLoop, Online],
        PageSent => &[PageSent, ReadPagesLoop, SnapshotDone, Online],
        SnapshotDone => &[SnapshotDone, Final, Online],
        Final => &[Online],
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RpcState {
    Idle,
    /// Message handed to the transport, send confirmation pending.
    Filled,
    /// Confirmed on the wire; the reply deadline is armed.
    Sent,
}

/// The outstanding RPC of the session: the message to re-send on timeout
/// plus its reply deadline.
#[derive(Debug)]
struct Rpc {
    state: RpcState,
    message: Option<Message>,
    deadline: Option<Millis>,
}

impl Rpc {
    fn idle() -> Self {
        Rpc { state: RpcState::Idle, message: None, deadline: None }
    }
}

/// Tuning knobs copied out of the server configuration.
#[derive(Clone, Copy, Debug)]
pub struct LeaderTuning {
    /// Reply deadline of every session RPC.
    pub rpc_timeout: Millis,
    /// Backoff before re-probing a follower that is still checksumming.
    pub sig_wait_interval: Millis,
    /// Page checksums requested per Signature message.
    pub sig_batch_pages: u32,
    /// Page moves packed into one Mv message.
    pub move_batch_pages: u32,
}

/// Drives one follower through an incremental snapshot installation.
pub struct LeaderSession {
    follower: NodeId,
    term: Term,
    stage: LeaderStage,
    snapshot: Snapshot,
    ht: ChecksumTable,
    rpc: Rpc,
    wait_deadline: Option<Millis>,
    tuning: LeaderTuning,

    sig_cursor: PageNo,
    sigs_done: bool,
    pending_sigs: Vec<PageChecksum>,

    page_cursor: PageNo,
    pending_moves: Vec<PageMove>,
    outgoing: VecDeque<ChunkPayload>,
    last_acked_page: PageNo,
}

impl LeaderSession {
    pub fn new(follower: NodeId, term: Term, snapshot: Snapshot, tuning: LeaderTuning) -> Self {
        LeaderSession {
            follower,
            term,
            stage: LeaderStage::Online,
            snapshot,
            ht: ChecksumTable::new(),
            rpc: Rpc::idle(),
            wait_deadline: None,
            tuning,
            sig_cursor: 0,
            sigs_done: false,
            pending_sigs: Vec::new(),
            page_cursor: 0,
            pending_moves: Vec::new(),
            outgoing: VecDeque::new(),
            last_acked_page: 0,
        }
    }

    pub fn follower(&self) -> NodeId {
        self.follower
    }

    pub fn stage(&self) -> LeaderStage {
        self.stage
    }

    /// Index of the last entry covered by the snapshot being installed.
    pub fn snapshot_last_index(&self) -> u64 {
        self.snapshot.meta.last_log_id.index
    }

    /// The earliest pending deadline, for the owning core's tick loop.
    pub fn next_deadline(&self) -> Option<Millis> {
        match (self.rpc.deadline, self.wait_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Begin the installation: build the checksum table in the
    /// background.
    pub fn start(&mut self, out: &mut Vec<SessionEffect>) {
        debug_assert_eq!(self.stage, LeaderStage::Online);
        self.move_to(LeaderStage::HtWait);
        out.push(SessionEffect::Work(WorkJob::HtCreate));
    }

    /// Feed one input into the machine.
    pub fn handle(&mut self, now: Millis, input: SessionInput<'_>, out: &mut Vec<SessionEffect>) {
        use LeaderStage::*;

        // An `unexpected` result from the peer voids the whole session,
        // whatever state it is in.
        if let SessionInput::Msg(msg) = &input {
            if msg.install_result() == Some(InstallResult::Unexpected) {
                tracing::debug!(follower = self.follower, stage = ?self.stage, "peer reports unexpected; resetting session");
                self.rpc = Rpc::idle();
                self.wait_deadline = None;
                self.move_to(Online);
                out.push(SessionEffect::Reset);
                return;
            }
        }

        match input {
            SessionInput::MsgSent => {
                if self.rpc.state == RpcState::Filled {
                    self.rpc.state = RpcState::Sent;
                    self.rpc.deadline = Some(now + self.tuning.rpc_timeout);
                }
            }
            SessionInput::SendFailed => {
                // Leave the message around and retry on the same schedule
                // as a lost reply.
                if self.rpc.state == RpcState::Filled {
                    self.rpc.state = RpcState::Sent;
                    self.rpc.deadline = Some(now + self.tuning.rpc_timeout);
                }
            }
            SessionInput::Timeout => self.handle_timeout(now, out),
            SessionInput::WorkDone(output) => self.handle_work(output, out),
            SessionInput::Msg(msg) => self.handle_msg(now, msg, out),
        }
    }

    /// Re-send the outstanding message, or re-probe for signatures.
    fn handle_timeout(&mut self, now: Millis, out: &mut Vec<SessionEffect>) {
        if self.stage == LeaderStage::WaitSigs {
            if self.wait_deadline.map(|at| now >= at).unwrap_or(false) {
                self.wait_deadline = None;
                self.move_to(LeaderStage::CheckSigs);
                self.send_probe(out);
            }
            return;
        }

        let expired = self.rpc.deadline.map(|at| now >= at).unwrap_or(false);
        if !expired {
            return;
        }
        if let Some(message) = self.rpc.message.clone() {
            tracing::debug!(follower = self.follower, stage = ?self.stage, kind = message.kind(), "reply deadline expired; re-sending");
            self.rpc.state = RpcState::Filled;
            self.rpc.deadline = None;
            out.push(SessionEffect::Send(message));
        }
    }

    fn handle_work(&mut self, output: WorkOutput, out: &mut Vec<SessionEffect>) {
        use LeaderStage::*;
        match (self.stage, output) {
            (HtWait, WorkOutput::HtCreated) => {
                self.move_to(NeedsSnapshot);
                let open = Message::InstallSnapshot(InstallSnapshotRequest {
                    version: InstallSnapshotRequest::VERSION,
                    term: self.term,
                    last_index: self.snapshot.meta.last_log_id.index,
                    last_term: self.snapshot.meta.last_log_id.term,
                    membership: self.snapshot.meta.membership.clone(),
                    membership_index: self.snapshot.meta.membership_index,
                    page_count: self.snapshot.pages.page_count(),
                    result: InstallResult::Ok,
                });
                self.send_rpc(open, out);
            }
            (ReceivedSigPart, WorkOutput::HtInserted) => {
                for sig in self.pending_sigs.drain(..) {
                    self.ht.insert(sig.checksum, sig.page_no);
                }
                self.move_to(PersistedSigPart);
                if self.sigs_done {
                    self.move_to(ReadPagesLoop);
                    self.advance_pages(out);
                } else {
                    self.move_to(RequestSigLoop);
                    self.send_sig_request(out);
                }
            }
            (PageRead, WorkOutput::PageRead { page_no, checksum, data }) => {
                debug_assert_eq!(page_no, self.page_cursor);
                if self.ht.contains_at(checksum, page_no) {
                    // The follower already has this exact page in place.
                    self.page_cursor += 1;
                    self.move_to(ReadPagesLoop);
                    self.advance_pages(out);
                } else if let Some(from) = self.ht.lookup(checksum) {
                    self.pending_moves.push(PageMove { from, to: page_no });
                    self.page_cursor += 1;
                    if self.pending_moves.len() >= self.tuning.move_batch_pages as usize {
                        self.flush_moves();
                        self.send_next_chunk(out);
                    } else {
                        self.move_to(ReadPagesLoop);
                        self.advance_pages(out);
                    }
                } else {
                    // Ship move batch first so the follower's source pages
                    // keep their meaning, then the raw page.
                    self.flush_moves();
                    self.outgoing.push_back(ChunkPayload::Cp { page_no, data });
                    self.page_cursor += 1;
                    self.send_next_chunk(out);
                }
            }
            (stage, output) => {
                tracing::trace!(follower = self.follower, ?stage, ?output, "ignoring stray work completion");
            }
        }
    }

    fn handle_msg(&mut self, now: Millis, msg: &Message, out: &mut Vec<SessionEffect>) {
        use LeaderStage::*;

        // Replies are only meaningful while a request is outstanding.
        if self.rpc.state == RpcState::Idle {
            return;
        }

        match (self.stage, msg) {
            (NeedsSnapshot, Message::InstallSnapshotResult(res)) if res.result == InstallResult::Ok => {
                self.rpc_replied();
                self.move_to(CheckSigs);
                self.send_probe(out);
            }
            (CheckSigs, Message::SignatureResult(res)) => {
                self.rpc_replied();
                self.move_to(WaitSigs);
                if res.calculated {
                    self.move_to(RequestSigLoop);
                    self.send_sig_request(out);
                } else {
                    self.wait_deadline = Some(now + self.tuning.sig_wait_interval);
                }
            }
            (RequestSigLoop, Message::SignatureResult(res)) => {
                self.rpc_replied();
                self.sigs_done = res.result == InstallResult::Done;
                self.sig_cursor = self.sig_cursor.max(res.cs_page_no.saturating_add(1));
                self.pending_sigs = res.cs.clone();
                self.move_to(ReceivedSigPart);
                out.push(SessionEffect::Work(WorkJob::HtInsert { sigs: res.cs.clone() }));
            }
            (PageSent, Message::SnapshotCpResult(res)) => {
                self.chunk_acked(res.last_known_page_no, out);
            }
            (PageSent, Message::SnapshotMvResult(res)) => {
                self.chunk_acked(res.last_known_page_no, out);
            }
            (SnapshotDone, Message::InstallSnapshotResult(res)) if res.result == InstallResult::Done => {
                self.rpc_replied();
                self.move_to(Final);
                self.move_to(Online);
                out.push(SessionEffect::Done);
            }
            (stage, msg) => {
                tracing::trace!(follower = self.follower, ?stage, kind = msg.kind(), "ignoring message not admitted in stage");
            }
        }
    }

    fn chunk_acked(&mut self, last_known: PageNo, out: &mut Vec<SessionEffect>) {
        self.rpc_replied();
        self.last_acked_page = self.last_acked_page.max(last_known);
        self.outgoing.pop_front();
        if !self.outgoing.is_empty() {
            self.send_next_chunk(out);
        } else {
            self.move_to(LeaderStage::ReadPagesLoop);
            self.advance_pages(out);
        }
    }

    /// Walk the page loop: read the next page, or flush the tail and
    /// close the installation.
    fn advance_pages(&mut self, out: &mut Vec<SessionEffect>) {
        use LeaderStage::*;
        debug_assert_eq!(self.stage, ReadPagesLoop);
        if self.page_cursor < self.snapshot.pages.page_count() {
            out.push(SessionEffect::Work(WorkJob::PageRead {
                pages: self.snapshot.pages.clone(),
                page_no: self.page_cursor,
            }));
            self.move_to(PageRead);
            return;
        }

        self.flush_moves();
        if !self.outgoing.is_empty() {
            self.send_next_chunk(out);
            return;
        }

        self.move_to(SnapshotDone);
        let done = Message::InstallSnapshot(InstallSnapshotRequest {
            version: InstallSnapshotRequest::VERSION,
            term: self.term,
            last_index: self.snapshot.meta.last_log_id.index,
            last_term: self.snapshot.meta.last_log_id.term,
            membership: self.snapshot.meta.membership.clone(),
            membership_index: self.snapshot.meta.membership_index,
            page_count: self.snapshot.pages.page_count(),
            result: InstallResult::Done,
        });
        self.send_rpc(done, out);
    }

    fn flush_moves(&mut self) {
        if !self.pending_moves.is_empty() {
            let moves = std::mem::take(&mut self.pending_moves);
            self.outgoing.push_back(ChunkPayload::Mv { moves });
        }
    }

    fn send_next_chunk(&mut self, out: &mut Vec<SessionEffect>) {
        let chunk = self.outgoing.front().expect("chunk queued");
        let msg = match chunk {
            ChunkPayload::Cp { page_no, data } => Message::SnapshotCp(SnapshotCpRequest {
                version: SnapshotCpRequest::VERSION,
                page_no: *page_no,
                page_data: data.clone(),
                result: InstallResult::Ok,
            }),
            ChunkPayload::Mv { moves } => Message::SnapshotMv(SnapshotMvRequest {
                version: SnapshotMvRequest::VERSION,
                moves: moves.clone(),
                result: InstallResult::Ok,
            }),
        };
        self.move_to(LeaderStage::PageSent);
        self.send_rpc(msg, out);
    }

    fn send_probe(&mut self, out: &mut Vec<SessionEffect>) {
        let probe = Message::Signature(SignatureRequest {
            version: SignatureRequest::VERSION,
            range: PageRange { from: 0, to: 0 },
            cs_page_no: 0,
            ask_calculated: true,
            result: InstallResult::Ok,
        });
        self.send_rpc(probe, out);
    }

    fn send_sig_request(&mut self, out: &mut Vec<SessionEffect>) {
        let from = self.sig_cursor;
        let to = from + self.tuning.sig_batch_pages.saturating_sub(1);
        let req = Message::Signature(SignatureRequest {
            version: SignatureRequest::VERSION,
            range: PageRange { from, to },
            cs_page_no: from,
            ask_calculated: false,
            result: InstallResult::Ok,
        });
        self.send_rpc(req, out);
    }

    fn send_rpc(&mut self, message: Message, out: &mut Vec<SessionEffect>) {
        self.rpc.state = RpcState::Filled;
        self.rpc.deadline = None;
        self.rpc.message = Some(message.clone());
        out.push(SessionEffect::Send(message));
    }

    fn rpc_replied(&mut self) {
        self.rpc = Rpc::idle();
    }

    fn move_to(&mut self, next: LeaderStage) {
        debug_assert!(
            allowed(self.stage).contains(&next),
            "illegal leader transition {:?} -> {:?}",
            self.stage,
            next
        );
        tracing::trace!(follower = self.follower, from = ?self.stage, to = ?next, "leader install transition");
        self.stage = next;
    }
}
