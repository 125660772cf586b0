//! Server-to-server RPC messages.
//!
//! Canonical field semantics live here; byte-exact wire layout is the
//! transport's business. Every message carries a `version` so future
//! fields can extend the trailing payload without breaking old decoders.

use bytes::Bytes;

use crate::entry::Entry;
use crate::membership::Membership;
use crate::Checksum;
use crate::LogIndex;
use crate::NodeId;
use crate::PageNo;
use crate::Term;

/// Feature bit announced in AppendEntries results: the sender understands
/// the incremental page-diff snapshot-install protocol.
pub const FEATURE_INCREMENTAL_SNAPSHOT: u64 = 1 << 0;

/// Feature flags a server announces about itself.
pub const DEFAULT_FEATURES: u64 = FEATURE_INCREMENTAL_SNAPSHOT;

/// Outcome code carried by every snapshot-install message and result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InstallResult {
    #[default]
    Ok,
    /// The message is not admitted in the receiver's current state; the
    /// sender should reset its session and start over.
    Unexpected,
    /// Final message of a phase or of the whole installation.
    Done,
}

/// A `(page number, checksum)` pair exchanged in signature messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageChecksum {
    pub page_no: PageNo,
    pub checksum: Checksum,
}

/// An inclusive page range `[from, to]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageRange {
    pub from: PageNo,
    pub to: PageNo,
}

/// One page remapping: the follower already holds the page content at
/// `from`; it belongs at `to` in the snapshot being installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageMove {
    pub from: PageNo,
    pub to: PageNo,
}

/// Invoked by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VoteRequest {
    pub version: u8,
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// True when the current leader should be discarded even if the
    /// receiver heard from it recently (leadership transfer).
    pub disrupt_leader: bool,
    /// True for the non-persistent pre-vote round.
    pub pre_vote: bool,
}

impl VoteRequest {
    pub const VERSION: u8 = 2;
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VoteResponse {
    pub version: u8,
    /// Receiver's current term, for the candidate to update itself.
    pub term: Term,
    pub vote_granted: bool,
    /// Echo of the request's `pre_vote` flag; pre-vote responses from a
    /// previous round are discarded by the term tag.
    pub pre_vote: bool,
}

impl VoteResponse {
    pub const VERSION: u8 = 2;
}

/// Invoked by the leader to replicate log entries; also used as heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppendEntriesRequest {
    pub version: u8,
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<Entry>,
}

impl AppendEntriesRequest {
    pub const VERSION: u8 = 0;

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "term={} prev={}-{} commit={} entries={}",
            self.term,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppendEntriesResponse {
    pub version: u8,
    pub term: Term,
    /// Zero on success; on rejection, the `prev_log_index` that was
    /// rejected.
    pub rejected: LogIndex,
    /// Receiver's last log index, as a rewind hint for the leader.
    pub last_log_index: LogIndex,
    /// Feature flags of the responding server.
    pub features: u64,
}

impl AppendEntriesResponse {
    pub const VERSION: u8 = 1;
}

/// Invoked by a leader to transfer leadership to a caught-up voter.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeoutNowRequest {
    pub version: u8,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl TimeoutNowRequest {
    pub const VERSION: u8 = 0;
}

/// Opens (and, with `result == Done`, closes) a snapshot installation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstallSnapshotRequest {
    pub version: u8,
    pub term: Term,
    /// Index of the last entry covered by the snapshot.
    pub last_index: LogIndex,
    pub last_term: Term,
    /// Committed configuration as of `last_index`, with its index.
    pub membership: Membership,
    pub membership_index: LogIndex,
    /// Number of pages in the leader's snapshot.
    pub page_count: PageNo,
    pub result: InstallResult,
}

impl InstallSnapshotRequest {
    pub const VERSION: u8 = 1;
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstallSnapshotResponse {
    pub version: u8,
    pub result: InstallResult,
}

impl InstallSnapshotResponse {
    pub const VERSION: u8 = 0;
}

/// Leader-to-follower: either a probe asking whether the follower has
/// finished computing its page checksums (`ask_calculated`), or a request
/// for the checksums in `range`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignatureRequest {
    pub version: u8,
    pub range: PageRange,
    /// Cursor for resynchronization: the first page of `range`.
    pub cs_page_no: PageNo,
    pub ask_calculated: bool,
    pub result: InstallResult,
}

impl SignatureRequest {
    pub const VERSION: u8 = 0;
}

/// Follower-to-leader: checksum readiness and/or one batch of checksums.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignatureResponse {
    pub version: u8,
    pub cs: Vec<PageChecksum>,
    /// Highest page number whose checksum the follower has reported,
    /// for resynchronization.
    pub cs_page_no: PageNo,
    pub calculated: bool,
    pub result: InstallResult,
}

impl SignatureResponse {
    pub const VERSION: u8 = 0;
}

/// One page's raw bytes, to be written at `page_no` on the follower.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotCpRequest {
    pub version: u8,
    pub page_no: PageNo,
    pub page_data: Bytes,
    pub result: InstallResult,
}

impl SnapshotCpRequest {
    pub const VERSION: u8 = 0;
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotCpResponse {
    pub version: u8,
    /// Used for retries and message losses.
    pub last_known_page_no: PageNo,
    pub result: InstallResult,
}

impl SnapshotCpResponse {
    pub const VERSION: u8 = 0;
}

/// A batch of page remappings exploiting pages the follower already has.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotMvRequest {
    pub version: u8,
    pub moves: Vec<PageMove>,
    pub result: InstallResult,
}

impl SnapshotMvRequest {
    pub const VERSION: u8 = 0;
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotMvResponse {
    pub version: u8,
    /// Used for retries and message losses.
    pub last_known_page_no: PageNo,
    pub result: InstallResult,
}

impl SnapshotMvResponse {
    pub const VERSION: u8 = 0;
}

/// A single RPC message that can be sent or received over the network.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::From)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Message {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResult(AppendEntriesResponse),
    RequestVote(VoteRequest),
    RequestVoteResult(VoteResponse),
    TimeoutNow(TimeoutNowRequest),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResult(InstallSnapshotResponse),
    Signature(SignatureRequest),
    SignatureResult(SignatureResponse),
    SnapshotCp(SnapshotCpRequest),
    SnapshotCpResult(SnapshotCpResponse),
    SnapshotMv(SnapshotMvRequest),
    SnapshotMvResult(SnapshotMvResponse),
}

impl Message {
    /// Short type name for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResult(_) => "append_entries_result",
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteResult(_) => "request_vote_result",
            Message::TimeoutNow(_) => "timeout_now",
            Message::InstallSnapshot(_) => "install_snapshot",
            Message::InstallSnapshotResult(_) => "install_snapshot_result",
            Message::Signature(_) => "signature",
            Message::SignatureResult(_) => "signature_result",
            Message::SnapshotCp(_) => "install_snapshot_cp",
            Message::SnapshotCpResult(_) => "install_snapshot_cp_result",
            Message::SnapshotMv(_) => "install_snapshot_mv",
            Message::SnapshotMvResult(_) => "install_snapshot_mv_result",
        }
    }

    /// The term carried by the message, when it has one. Snapshot-install
    /// data messages are session-scoped and carry no term.
    pub fn term(&self) -> Option<Term> {
        match self {
            Message::AppendEntries(m) => Some(m.term),
            Message::AppendEntriesResult(m) => Some(m.term),
            Message::RequestVote(m) => Some(m.term),
            Message::RequestVoteResult(m) => Some(m.term),
            Message::TimeoutNow(m) => Some(m.term),
            Message::InstallSnapshot(m) => Some(m.term),
            _ => None,
        }
    }

    /// Whether this message belongs to the snapshot-install family.
    pub fn is_install_family(&self) -> bool {
        matches!(
            self,
            Message::InstallSnapshot(_)
                | Message::InstallSnapshotResult(_)
                | Message::Signature(_)
                | Message::SignatureResult(_)
                | Message::SnapshotCp(_)
                | Message::SnapshotCpResult(_)
                | Message::SnapshotMv(_)
                | Message::SnapshotMvResult(_)
        )
    }

    /// The `result` code, for the message variants that carry one.
    pub fn install_result(&self) -> Option<InstallResult> {
        match self {
            Message::InstallSnapshot(m) => Some(m.result),
            Message::InstallSnapshotResult(m) => Some(m.result),
            Message::Signature(m) => Some(m.result),
            Message::SignatureResult(m) => Some(m.result),
            Message::SnapshotCp(m) => Some(m.result),
            Message::SnapshotCpResult(m) => Some(m.result),
            Message::SnapshotMv(m) => Some(m.result),
            Message::SnapshotMvResult(m) => Some(m.result),
            _ => None,
        }
    }
}
