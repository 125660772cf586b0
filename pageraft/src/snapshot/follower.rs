//! Follower side of the snapshot-install protocol.

use crate::message::InstallResult;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::Message;
use crate::message::PageChecksum;
use crate::message::PageRange;
use crate::message::SignatureResponse;
use crate::message::SnapshotCpResponse;
use crate::message::SnapshotMvResponse;
use crate::snapshot::ChecksumTable;
use crate::snapshot::ChunkPayload;
use crate::snapshot::PageSet;
use crate::snapshot::SessionEffect;
use crate::snapshot::SessionInput;
use crate::snapshot::WorkJob;
use crate::snapshot::WorkOutput;
use crate::storage::Snapshot;
use crate::storage::SnapshotMeta;
use crate::LogId;
use crate::NodeId;
use crate::PageNo;

/// States of the follower-side machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowerStage {
    /// No installation in progress.
    Normal,
    /// Creating the checksum table.
    HtCreate,
    HtWait,
    /// Kicking off the background checksum computation.
    SigsCalcStarted,
    /// Checksumming batch by batch; answering readiness probes.
    SigsCalcLoop,
    SigsCalcMsgReceived,
    SigsCalcDone,
    /// Waiting for the leader to request a checksum range.
    SigReceiving,
    /// A range request is being served by a background read.
    SigProcessed,
    SigRead,
    SigReplied,
    /// Waiting for Cp/Mv chunks.
    ChunkReceiving,
    ChunkProcessed,
    ChunkApplied,
    ChunkReplied,
    /// Final InstallSnapshot received; the assembled content is handed
    /// over for installation.
    SnapDone,
    Final,
}

/// Legal moves, checked on every transition. `Normal` is reachable from
/// everywhere: replying `unexpected` aborts the session on the spot.
fn allowed(from: FollowerStage) -> &'static [FollowerStage] {
    use FollowerStage::*;
    match from {
        Normal => &[HtCreate, Normal],
        HtCreate => &[HtWait, Normal],
        HtWait => &[SigsCalcStarted, Normal],
        SigsCalcStarted => &[SigsCalcLoop, Normal],
        SigsCalcLoop => &[SigsCalcLoop, SigsCalcMsgReceived, SigsCalcDone, Normal],
        SigsCalcMsgReceived => &[SigsCalcLoop, Normal],
        SigsCalcDone => &[SigReceiving, Normal],
        SigReceiving => &[SigProcessed, SigReceiving, Normal],
        SigProcessed => &[SigRead, Normal],
        SigRead => &[SigReplied, Normal],
        SigReplied => &[ChunkReceiving, SigReceiving, Normal],
        ChunkReceiving => &[ChunkProcessed, ChunkReceiving, SnapDone, Normal],
        ChunkProcessed => &[ChunkApplied, Normal],
        ChunkApplied => &[ChunkReplied, Normal],
        ChunkReplied => &[ChunkProcessed, SnapDone, Normal],
        SnapDone => &[SnapDone, Final, Normal],
        Final => &[Normal],
    }
}

/// Assembles an incoming snapshot from checksummed local pages plus the
/// chunks the leader ships.
///
/// Moves read from the content captured when the session began, never
/// from the staging area, so a `Mv` keeps its meaning regardless of the
/// `Cp`s applied before it and re-applying any chunk is harmless.
pub struct FollowerSession {
    stage: FollowerStage,
    leader: NodeId,

    /// Local content captured at session start; checksummed and used as
    /// the source for `Mv` chunks.
    original: PageSet,
    /// The snapshot being assembled.
    staged: PageSet,

    ht: ChecksumTable,
    sigs: Vec<PageChecksum>,
    sigs_calculated: bool,
    calc_cursor: PageNo,
    sig_batch_pages: u32,

    meta: SnapshotMeta,
    page_count: PageNo,
    last_acked_page: PageNo,
    /// Whether the range served by the in-flight read was the last one.
    pending_done: bool,

    /// Set when the final InstallSnapshot arrives; taken by the core.
    installed: Option<Snapshot>,
}

impl FollowerSession {
    pub fn idle(sig_batch_pages: u32) -> Self {
        FollowerSession {
            stage: FollowerStage::Normal,
            leader: 0,
            original: PageSet::default(),
            staged: PageSet::default(),
            ht: ChecksumTable::new(),
            sigs: Vec::new(),
            sigs_calculated: false,
            calc_cursor: 0,
            sig_batch_pages,
            meta: SnapshotMeta { last_log_id: LogId::default(), membership: Default::default(), membership_index: 0 },
            page_count: 0,
            last_acked_page: 0,
            pending_done: false,
            installed: None,
        }
    }

    pub fn stage(&self) -> FollowerStage {
        self.stage
    }

    pub fn is_active(&self) -> bool {
        self.stage != FollowerStage::Normal
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }

    /// The snapshot assembled by a completed installation, once.
    pub fn take_installed(&mut self) -> Option<Snapshot> {
        self.installed.take()
    }

    /// Open a session: the core passes the captured local content along
    /// with the InstallSnapshot that initiated the installation.
    pub fn begin(
        &mut self,
        leader: NodeId,
        own_pages: PageSet,
        req: &InstallSnapshotRequest,
        out: &mut Vec<SessionEffect>,
    ) {
        debug_assert_eq!(self.stage, FollowerStage::Normal);
        debug_assert_eq!(req.result, InstallResult::Ok);

        self.leader = leader;
        self.meta = SnapshotMeta {
            last_log_id: LogId::new(req.last_term, req.last_index),
            membership: req.membership.clone(),
            membership_index: req.membership_index,
        };
        self.page_count = req.page_count;
        self.staged = own_pages.clone();
        self.staged.truncate_pages(req.page_count);
        self.original = own_pages;
        self.sigs.clear();
        self.ht = ChecksumTable::new();
        self.sigs_calculated = false;
        self.calc_cursor = 0;
        self.last_acked_page = 0;
        self.installed = None;

        self.move_to(FollowerStage::HtCreate);
        out.push(SessionEffect::Work(WorkJob::HtCreate));
        self.move_to(FollowerStage::HtWait);
    }

    /// Feed one input into the machine.
    pub fn handle(&mut self, input: SessionInput<'_>, out: &mut Vec<SessionEffect>) {
        match input {
            SessionInput::MsgSent => self.on_sent(out),
            SessionInput::SendFailed => {
                // The reply is lost; the leader's retry drives recovery.
                tracing::debug!(stage = ?self.stage, "reply send failed; waiting for the leader to retry");
            }
            SessionInput::Timeout => {
                // The follower side runs no timers.
            }
            SessionInput::WorkDone(output) => self.handle_work(output, out),
            SessionInput::Msg(msg) => self.handle_msg(msg, out),
        }
    }

    fn handle_work(&mut self, output: WorkOutput, out: &mut Vec<SessionEffect>) {
        use FollowerStage::*;
        match (self.stage, output) {
            (HtWait, WorkOutput::HtCreated) => {
                out.push(SessionEffect::Send(Message::InstallSnapshotResult(InstallSnapshotResponse {
                    version: InstallSnapshotResponse::VERSION,
                    result: InstallResult::Ok,
                })));
            }
            (SigsCalcLoop, WorkOutput::SigsCalculated { from, sigs })
            | (SigsCalcMsgReceived, WorkOutput::SigsCalculated { from, sigs }) => {
                let _ = from;
                for sig in &sigs {
                    self.ht.insert(sig.checksum, sig.page_no);
                }
                self.sigs.extend_from_slice(&sigs);
                self.calc_cursor += self.sig_batch_pages;
                if (sigs.len() as u32) < self.sig_batch_pages || self.calc_cursor >= self.original.page_count() {
                    self.sigs_calculated = true;
                } else {
                    out.push(SessionEffect::Work(WorkJob::CalcSigs {
                        pages: self.original.clone(),
                        from: self.calc_cursor,
                        to: self.calc_cursor + self.sig_batch_pages - 1,
                    }));
                }
            }
            (SigProcessed, WorkOutput::SigsRead { sigs, done }) => {
                self.move_to(SigRead);
                self.pending_done = done;
                let cs_page_no = sigs.last().map(|s| s.page_no).unwrap_or(0);
                out.push(SessionEffect::Send(Message::SignatureResult(SignatureResponse {
                    version: SignatureResponse::VERSION,
                    cs: sigs,
                    cs_page_no,
                    calculated: true,
                    result: if done { InstallResult::Done } else { InstallResult::Ok },
                })));
            }
            (ChunkProcessed, WorkOutput::ChunkWritten { chunk }) => {
                self.apply_chunk(&chunk);
                self.move_to(ChunkApplied);
                self.last_acked_page = self.last_acked_page.max(chunk.last_page_no());
                out.push(SessionEffect::Send(self.chunk_ack(&chunk)));
            }
            (stage, output) => {
                tracing::trace!(?stage, ?output, "ignoring stray work completion");
            }
        }
    }

    fn handle_msg(&mut self, msg: &Message, out: &mut Vec<SessionEffect>) {
        use FollowerStage::*;
        match (self.stage, msg) {
            // Readiness probes.
            (SigsCalcLoop, Message::Signature(req)) if req.ask_calculated => {
                if self.sigs_calculated {
                    self.move_to(SigsCalcDone);
                    out.push(self.calculated_reply(true));
                } else {
                    self.move_to(SigsCalcMsgReceived);
                    out.push(self.calculated_reply(false));
                }
            }
            // A probe retried after its reply got lost.
            (SigReceiving, Message::Signature(req)) if req.ask_calculated => {
                out.push(self.calculated_reply(true));
            }
            (ChunkReceiving, Message::Signature(req)) if req.ask_calculated => {
                out.push(self.calculated_reply(true));
            }

            // Checksum range requests.
            (SigReceiving, Message::Signature(req)) => {
                self.move_to(SigProcessed);
                let (sigs, done) = self.sigs_in_range(req.range);
                out.push(SessionEffect::Work(WorkJob::ReadSig { sigs, done }));
            }
            // A range request retried after its reply got lost: serve it
            // again without leaving the chunk phase.
            (ChunkReceiving, Message::Signature(req)) => {
                let (sigs, done) = self.sigs_in_range(req.range);
                let cs_page_no = sigs.last().map(|s| s.page_no).unwrap_or(0);
                out.push(SessionEffect::Send(Message::SignatureResult(SignatureResponse {
                    version: SignatureResponse::VERSION,
                    cs: sigs,
                    cs_page_no,
                    calculated: true,
                    result: if done { InstallResult::Done } else { InstallResult::Ok },
                })));
            }

            // Data chunks.
            (ChunkReceiving, Message::SnapshotCp(req)) | (ChunkReplied, Message::SnapshotCp(req)) => {
                let chunk = ChunkPayload::Cp { page_no: req.page_no, data: req.page_data.clone() };
                self.receive_chunk(chunk, out);
            }
            (ChunkReceiving, Message::SnapshotMv(req)) | (ChunkReplied, Message::SnapshotMv(req)) => {
                let chunk = ChunkPayload::Mv { moves: req.moves.clone() };
                self.receive_chunk(chunk, out);
            }

            // Closing handshake.
            (ChunkReceiving, Message::InstallSnapshot(req)) | (ChunkReplied, Message::InstallSnapshot(req))
                if req.result == InstallResult::Done =>
            {
                self.move_to(SnapDone);
                self.installed = Some(Snapshot { meta: self.meta.clone(), pages: self.staged.clone() });
                out.push(SessionEffect::Done);
                out.push(SessionEffect::Send(Message::InstallSnapshotResult(InstallSnapshotResponse {
                    version: InstallSnapshotResponse::VERSION,
                    result: InstallResult::Done,
                })));
            }
            // The final handshake retried after its reply got lost.
            (SnapDone, Message::InstallSnapshot(req)) if req.result == InstallResult::Done => {
                out.push(SessionEffect::Send(Message::InstallSnapshotResult(InstallSnapshotResponse {
                    version: InstallSnapshotResponse::VERSION,
                    result: InstallResult::Done,
                })));
            }

            // Anything else is not admitted here: reply `unexpected` with
            // the same message family and abort the session.
            (stage, msg) => {
                tracing::debug!(?stage, kind = msg.kind(), "message not admitted; replying unexpected");
                if let Some(reply) = unexpected_reply(msg) {
                    out.push(SessionEffect::Send(reply));
                }
                self.reset();
            }
        }
    }

    fn on_sent(&mut self, out: &mut Vec<SessionEffect>) {
        use FollowerStage::*;
        match self.stage {
            HtWait => {
                self.move_to(SigsCalcStarted);
                self.start_calc(out);
                self.move_to(SigsCalcLoop);
            }
            SigsCalcMsgReceived => self.move_to(SigsCalcLoop),
            SigsCalcDone => self.move_to(SigReceiving),
            SigRead => {
                self.move_to(SigReplied);
                if self.pending_done {
                    self.move_to(ChunkReceiving);
                } else {
                    self.move_to(SigReceiving);
                }
            }
            ChunkApplied => self.move_to(ChunkReplied),
            SnapDone => {
                self.move_to(Final);
                self.move_to(Normal);
                self.reset();
            }
            // Re-acks and unexpected replies carry no transition.
            _ => {}
        }
    }

    fn receive_chunk(&mut self, chunk: ChunkPayload, out: &mut Vec<SessionEffect>) {
        self.move_to(FollowerStage::ChunkProcessed);
        out.push(SessionEffect::Work(WorkJob::WriteChunk { chunk }));
    }

    /// Apply a persisted chunk to the staging area. `Mv` sources come
    /// from the session-start capture, so re-application is idempotent.
    fn apply_chunk(&mut self, chunk: &ChunkPayload) {
        match chunk {
            ChunkPayload::Cp { page_no, data } => {
                self.staged.write_page(*page_no, data.clone());
            }
            ChunkPayload::Mv { moves } => {
                for mv in moves {
                    let data = self.original.read_page(mv.from).unwrap_or_default();
                    self.staged.write_page(mv.to, data);
                }
            }
        }
    }

    fn chunk_ack(&self, chunk: &ChunkPayload) -> Message {
        match chunk {
            ChunkPayload::Cp { .. } => Message::SnapshotCpResult(SnapshotCpResponse {
                version: SnapshotCpResponse::VERSION,
                last_known_page_no: self.last_acked_page,
                result: InstallResult::Ok,
            }),
            ChunkPayload::Mv { .. } => Message::SnapshotMvResult(SnapshotMvResponse {
                version: SnapshotMvResponse::VERSION,
                last_known_page_no: self.last_acked_page,
                result: InstallResult::Ok,
            }),
        }
    }

    fn calculated_reply(&self, calculated: bool) -> SessionEffect {
        SessionEffect::Send(Message::SignatureResult(SignatureResponse {
            version: SignatureResponse::VERSION,
            cs: Vec::new(),
            cs_page_no: 0,
            calculated,
            result: InstallResult::Ok,
        }))
    }

    fn start_calc(&mut self, out: &mut Vec<SessionEffect>) {
        if self.original.page_count() == 0 {
            self.sigs_calculated = true;
            return;
        }
        out.push(SessionEffect::Work(WorkJob::CalcSigs {
            pages: self.original.clone(),
            from: 0,
            to: self.sig_batch_pages - 1,
        }));
    }

    /// The checksums falling in `range`, and whether the range covers the
    /// end of the local content.
    fn sigs_in_range(&self, range: PageRange) -> (Vec<PageChecksum>, bool) {
        let sigs = self
            .sigs
            .iter()
            .filter(|s| s.page_no >= range.from && s.page_no <= range.to)
            .copied()
            .collect();
        let done = u64::from(range.to) + 1 >= u64::from(self.original.page_count());
        (sigs, done)
    }

    fn reset(&mut self) {
        if self.stage != FollowerStage::Normal {
            self.move_to(FollowerStage::Normal);
        }
        self.leader = 0;
        self.original = PageSet::default();
        self.staged = PageSet::default();
        self.ht = ChecksumTable::new();
        self.sigs.clear();
        self.sigs_calculated = false;
        self.calc_cursor = 0;
        self.page_count = 0;
        self.last_acked_page = 0;
        self.pending_done = false;
    }

    fn move_to(&mut self, next: FollowerStage) {
        debug_assert!(
            allowed(self.stage).contains(&next),
            "illegal follower transition {:?} -> {:?}",
            self.stage,
            next
        );
        tracing::trace!(from = ?self.stage, to = ?next, "follower install transition");
        self.stage = next;
    }
}

/// Build the `unexpected` reply of the same family as `msg`, when `msg`
/// is one the follower answers at all.
fn unexpected_reply(msg: &Message) -> Option<Message> {
    let reply = match msg {
        Message::InstallSnapshot(_) => Message::InstallSnapshotResult(InstallSnapshotResponse {
            version: InstallSnapshotResponse::VERSION,
            result: InstallResult::Unexpected,
        }),
        Message::Signature(_) => Message::SignatureResult(SignatureResponse {
            version: SignatureResponse::VERSION,
            cs: Vec::new(),
            cs_page_no: 0,
            calculated: false,
            result: InstallResult::Unexpected,
        }),
        Message::SnapshotCp(_) => Message::SnapshotCpResult(SnapshotCpResponse {
            version: SnapshotCpResponse::VERSION,
            last_known_page_no: 0,
            result: InstallResult::Unexpected,
        }),
        Message::SnapshotMv(_) => Message::SnapshotMvResult(SnapshotMvResponse {
            version: SnapshotMvResponse::VERSION,
            last_known_page_no: 0,
            result: InstallResult::Unexpected,
        }),
        _ => return None,
    };
    Some(reply)
}
