//! The transport collaborator.

use async_trait::async_trait;

use crate::error::NetworkError;
use crate::message::Message;
use crate::NodeId;

/// Sends messages to other servers.
///
/// Inbound messages are delivered to the engine by calling
/// [`Raft::handle_message`](crate::raft::Raft::handle_message) from the
/// transport's receive path; decoding failures are dropped there, the
/// sender retries or times out.
///
/// A send failure is reported back to the core as a completion event, it
/// is never fatal: the affected peer drops back to probe mode or its
/// snapshot-install session restarts.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn send(&self, target: NodeId, target_address: &str, message: Message) -> Result<(), NetworkError>;
}
