//! The storage collaborator: durable term/vote, log segments, snapshots.

use async_trait::async_trait;

use crate::entry::Entry;
use crate::error::StorageError;
use crate::membership::Membership;
use crate::snapshot::PageSet;
use crate::LogId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// Identity of a snapshot plus the membership it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SnapshotMeta {
    /// Index and term of the last entry covered by the snapshot.
    pub last_log_id: LogId,
    /// Committed configuration as of `last_log_id.index`.
    pub membership: Membership,
    pub membership_index: LogIndex,
}

/// A complete snapshot: identity plus page-addressable content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub pages: PageSet,
}

/// Everything the core needs to resume from stable storage.
#[derive(Debug, Default)]
pub struct InitialState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub snapshot: Option<Snapshot>,
    /// Index of the first entry in `entries`.
    pub start_index: LogIndex,
    pub entries: Vec<Entry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            meta: SnapshotMeta {
                last_log_id: LogId::default(),
                membership: Membership::new(),
                membership_index: 0,
            },
            pages: PageSet::default(),
        }
    }
}

/// Durable storage operations, all completing asynchronously.
///
/// Ordering contract: calls are issued by a single driver task and must
/// complete in submission order. `set_term` and `set_vote` must be durable
/// before they return; the core will not hand out a reply that depends on
/// them until then.
#[async_trait]
pub trait RaftStorage: Send + 'static {
    /// Read the persisted state at startup.
    async fn load(&mut self) -> Result<InitialState, StorageError>;

    async fn set_term(&mut self, term: Term) -> Result<(), StorageError>;

    async fn set_vote(&mut self, voted_for: Option<NodeId>) -> Result<(), StorageError>;

    /// Persist `entries`, the first of which has index `first_index`.
    async fn append(&mut self, first_index: LogIndex, entries: Vec<Entry>) -> Result<(), StorageError>;

    /// Remove persisted entries with index >= `from`.
    async fn truncate(&mut self, from: LogIndex) -> Result<(), StorageError>;

    /// Persist a snapshot, after which at most `trailing` entries before
    /// its last index need to be retained.
    async fn snapshot_put(&mut self, trailing: u64, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Fetch the most recent persisted snapshot.
    async fn snapshot_get(&mut self) -> Result<Option<Snapshot>, StorageError>;

    /// Initialize a pristine server with a first configuration entry at
    /// index 1, term 1. Must fail when any state exists already.
    async fn bootstrap(&mut self, membership: Membership) -> Result<(), StorageError>;

    /// Force-append a configuration entry to recover from quorum loss.
    /// Only legal on a stopped server.
    async fn recover(&mut self, membership: Membership) -> Result<(), StorageError>;
}
