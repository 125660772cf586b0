//! Observable server state, published by the driver on every change.

use std::collections::BTreeMap;

use crate::membership::Membership;
use crate::LogIndex;
use crate::NodeId;
use crate::ServerState;
use crate::Term;

/// Replication progress of one peer, as seen by the leader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub match_index: LogIndex,
}

/// A point-in-time snapshot of a server's observable state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: ServerState,
    pub current_term: Term,
    pub last_log_index: LogIndex,
    pub last_applied: LogIndex,
    pub commit_index: LogIndex,
    pub current_leader: Option<NodeId>,
    /// Voters heard from within the last election timeout; only
    /// meaningful on a leader.
    pub voter_contacts: usize,
    pub membership: Membership,
    /// Per-peer progress while leading, empty otherwise.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

impl RaftMetrics {
    pub fn initial(id: NodeId) -> Self {
        RaftMetrics {
            id,
            state: ServerState::Unavailable,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            current_leader: None,
            voter_contacts: 0,
            membership: Membership::new(),
            replication: BTreeMap::new(),
        }
    }
}
