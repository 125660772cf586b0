//! # pageraft
//!
//! A Raft consensus engine with an incremental, page-level snapshot
//! installation protocol.
//!
//! The crate is split in two layers:
//!
//! - [`core::RaftCore`] is a deterministic, sans-IO state machine. It is
//!   driven by explicit events (clock ticks, inbound messages, storage and
//!   background-work completions) and emits explicit [`core::Effect`]s
//!   (outbound messages, disk writes, background jobs, request
//!   completions). It never blocks and never performs IO itself.
//! - [`raft::Raft`] is an async handle that runs the core on a tokio task
//!   and owns the collaborator implementations: [`storage::RaftStorage`],
//!   [`network::RaftNetwork`] and [`state_machine::StateMachine`].
//!
//! Lagging followers that have fallen behind the leader's snapshot anchor
//! are caught up with the page-diff protocol in [`snapshot`]: the follower
//! computes checksums of the pages it already has, the leader ships only
//! pages the follower is missing (`Cp`) or has at the wrong position
//! (`Mv`), and both sides track progress with a pair of explicitly encoded
//! state machines.

pub mod config;
pub mod core;
pub mod entry;
pub mod error;
pub mod log;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod network;
pub mod progress;
pub mod raft;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod testing;

use std::fmt;

// Top-level exports.
pub use crate::config::Config;
pub use crate::entry::Entry;
pub use crate::entry::EntryPayload;
pub use crate::error::RaftError;
pub use crate::membership::Membership;
pub use crate::membership::Role;
pub use crate::message::Message;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::state_machine::StateMachine;
pub use crate::storage::RaftStorage;

/// A Raft node's ID.
pub type NodeId = u64;

/// A leadership epoch. Terms increase monotonically on every election.
pub type Term = u64;

/// A 1-based position in the replicated log. Zero means "no entry".
pub type LogIndex = u64;

/// A monotonic timestamp in milliseconds, as reported by the clock
/// collaborator. The origin is arbitrary; only differences matter.
pub type Millis = u64;

/// A page number inside a snapshot or database, 0-based.
pub type PageNo = u32;

/// A 32-bit page checksum.
pub type Checksum = u32;

/// The term and index identifying one log entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogId {
    pub term: Term,
    pub index: LogIndex,
}

impl LogId {
    pub fn new(term: Term, index: LogIndex) -> Self {
        LogId { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// The observable state of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServerState {
    /// Not yet started, or shut down after a fatal error.
    Unavailable,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Unavailable => "unavailable",
            ServerState::Follower => "follower",
            ServerState::Candidate => "candidate",
            ServerState::Leader => "leader",
        };
        write!(f, "{}", s)
    }
}
