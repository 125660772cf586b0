//! Error types exposed at the core boundary and by the collaborators.

use anyerror::AnyError;

use crate::NodeId;

/// Errors surfaced by the public API and carried inside request
/// completions.
///
/// Every variant maps to one stable code with a one-line description; the
/// description is the `Display` output, the code name is available through
/// [`RaftError::name`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    #[error("out of memory")]
    Nomem,

    #[error("server ID is not valid")]
    BadId,

    #[error("server ID already in use")]
    DuplicateId,

    #[error("server address already in use")]
    DuplicateAddress,

    #[error("server role is not valid")]
    BadRole,

    #[error("encoded data is malformed")]
    Malformed,

    #[error("server is not the leader")]
    NotLeader,

    #[error("server has lost leadership")]
    LeadershipLost,

    #[error("server is shutting down")]
    Shutdown,

    #[error("bootstrap only works on new clusters")]
    CantBootstrap,

    #[error("a configuration change is already in progress")]
    CantChange,

    #[error("persisted data is corrupted")]
    Corrupt,

    #[error("operation canceled")]
    Canceled,

    #[error("data directory path is too long")]
    NameTooLong,

    #[error("data is too big")]
    TooBig,

    #[error("no connection to remote server available")]
    NoConnection,

    #[error("operation can't be performed at this time")]
    Busy,

    #[error("I/O error")]
    IoErr,

    #[error("resource not found")]
    NotFound,

    #[error("invalid parameter")]
    Invalid,

    #[error("no access to resource")]
    Unauthorized,

    #[error("not enough space to complete operation")]
    NoSpace,

    #[error("system or raft limit hit")]
    TooMany,
}

impl RaftError {
    /// The stable, machine-readable name of the code.
    pub fn name(&self) -> &'static str {
        match self {
            RaftError::Nomem => "nomem",
            RaftError::BadId => "bad_id",
            RaftError::DuplicateId => "duplicate_id",
            RaftError::DuplicateAddress => "duplicate_address",
            RaftError::BadRole => "bad_role",
            RaftError::Malformed => "malformed",
            RaftError::NotLeader => "not_leader",
            RaftError::LeadershipLost => "leadership_lost",
            RaftError::Shutdown => "shutdown",
            RaftError::CantBootstrap => "cant_bootstrap",
            RaftError::CantChange => "cant_change",
            RaftError::Corrupt => "corrupt",
            RaftError::Canceled => "canceled",
            RaftError::NameTooLong => "name_too_long",
            RaftError::TooBig => "too_big",
            RaftError::NoConnection => "no_connection",
            RaftError::Busy => "busy",
            RaftError::IoErr => "io_err",
            RaftError::NotFound => "not_found",
            RaftError::Invalid => "invalid",
            RaftError::Unauthorized => "unauthorized",
            RaftError::NoSpace => "no_space",
            RaftError::TooMany => "too_many",
        }
    }
}

/// Failure reported by the storage collaborator.
///
/// `Corrupt` during load and persistent failures to update term or vote are
/// fatal: safety can no longer be upheld and the server transitions to
/// `Unavailable`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(AnyError),

    #[error("not enough space on disk: {0}")]
    NoSpace(AnyError),

    #[error("persisted state is corrupted: {0}")]
    Corrupt(AnyError),

    #[error("storage request canceled")]
    Canceled,

    #[error("out of memory")]
    Nomem,

    #[error("data is too big")]
    TooBig,
}

impl StorageError {
    pub fn code(&self) -> RaftError {
        match self {
            StorageError::Io(_) => RaftError::IoErr,
            StorageError::NoSpace(_) => RaftError::NoSpace,
            StorageError::Corrupt(_) => RaftError::Corrupt,
            StorageError::Canceled => RaftError::Canceled,
            StorageError::Nomem => RaftError::Nomem,
            StorageError::TooBig => RaftError::TooBig,
        }
    }
}

/// Failure reported by the transport collaborator.
///
/// These are always recovered locally: a failed send rewinds the peer to
/// probe mode or resets the snapshot-install session, it never surfaces to
/// the caller.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no connection to {target}")]
    NoConnection { target: NodeId },

    #[error("transport I/O error: {0}")]
    Io(AnyError),

    #[error("send canceled")]
    Canceled,

    #[error("out of memory")]
    Nomem,

    #[error("received malformed message")]
    Malformed,
}

/// Invalid [`Config`](crate::config::Config) field combinations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("election timeout ({election}ms) must be larger than heartbeat interval ({heartbeat}ms)")]
    ElectionTimeoutNotLargerThanHeartbeat { election: u64, heartbeat: u64 },

    #[error("page size must not be zero")]
    ZeroPageSize,

    #[error("max entries per append message must not be zero")]
    ZeroAppendBatch,
}

/// Why a vote was not granted; used in trace output only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VoteRejectReason {
    StaleTerm,
    AlreadyVoted { for_id: NodeId },
    LogBehind,
    HaveLeader,
}
