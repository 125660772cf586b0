//! The application state machine collaborator.

use bytes::Bytes;

use crate::entry::Entry;
use crate::snapshot::PageSet;
use crate::LogIndex;

/// The replicated application.
///
/// `apply` runs on the driver task in log order and must be fast; anything
/// slow belongs in the application behind its own queue. Snapshot capture
/// and restore exchange page-addressable content so the incremental
/// snapshot-install protocol can diff and ship individual pages.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command, returning the response for the client
    /// that proposed it. Barrier and membership entries are not passed
    /// here.
    fn apply(&mut self, index: LogIndex, entry: &Entry) -> Bytes;

    /// Capture the current content as pages of `page_size` bytes.
    fn snapshot(&self, page_size: u32) -> PageSet;

    /// Replace the current content with a received snapshot.
    fn restore(&mut self, pages: &PageSet);
}
