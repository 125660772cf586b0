//! Log entries.

use std::fmt;

use bytes::Bytes;

use crate::membership::Membership;
use crate::Term;

/// Fixed-size auxiliary data attached to an entry by the local node.
///
/// A leader fills this in before appending an entry to its volatile log;
/// a follower fills in its own value when accepting the entry from an
/// AppendEntries message. The slot is stored in the local log only and is
/// never part of an outbound AppendEntries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocalData(pub [u8; 16]);

/// The application-visible content of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EntryPayload {
    /// An opaque application command, applied to the state machine on
    /// commit.
    Command(Bytes),

    /// Carries no data. Committing a barrier guarantees every earlier
    /// entry has been applied; a new leader appends one to flush the
    /// pipeline and commit prior-term entries.
    Barrier,

    /// A membership configuration, effective as soon as it is appended.
    Membership(Membership),
}

impl EntryPayload {
    pub fn summary(&self) -> String {
        match self {
            EntryPayload::Command(buf) => format!("command({}B)", buf.len()),
            EntryPayload::Barrier => "barrier".to_string(),
            EntryPayload::Membership(m) => format!("membership({} servers)", m.len()),
        }
    }
}

/// A single entry in the raft log.
///
/// Entries received in one AppendEntries message or loaded from disk in
/// one batch share their backing buffer: each `Command` payload is a
/// [`Bytes`] view into the batch allocation, which is released when the
/// last view is dropped. The log store additionally tracks explicit
/// acquisition counts so a truncation never invalidates a slice handed to
/// an in-flight disk write or send (see [`crate::log::LogStore`]).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Entry {
    /// Term in which the entry was created.
    pub term: Term,

    pub payload: EntryPayload,

    /// True iff the entry was appended by this node while it was leader.
    /// Not sent on the wire: a follower stores received entries with
    /// `is_local == false`.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub is_local: bool,

    /// Node-local auxiliary data, never sent on the wire.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub local_data: LocalData,
}

impl Entry {
    pub fn new_command(term: Term, buf: Bytes) -> Self {
        Entry { term, payload: EntryPayload::Command(buf), is_local: false, local_data: LocalData::default() }
    }

    pub fn new_barrier(term: Term) -> Self {
        Entry { term, payload: EntryPayload::Barrier, is_local: false, local_data: LocalData::default() }
    }

    pub fn new_membership(term: Term, membership: Membership) -> Self {
        Entry { term, payload: EntryPayload::Membership(membership), is_local: false, local_data: LocalData::default() }
    }

    pub fn is_membership(&self) -> bool {
        matches!(self.payload, EntryPayload::Membership(_))
    }

    /// The copy of this entry that goes into an AppendEntries message:
    /// same term and payload, local-only fields cleared.
    pub fn to_wire(&self) -> Entry {
        Entry {
            term: self.term,
            payload: self.payload.clone(),
            is_local: false,
            local_data: LocalData::default(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.payload.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_copy_drops_local_fields() {
        let mut entry = Entry::new_command(3, Bytes::from_static(b"set x=1"));
        entry.is_local = true;
        entry.local_data = LocalData([7; 16]);

        let wire = entry.to_wire();
        assert_eq!(wire.term, 3);
        assert_eq!(wire.payload, entry.payload);
        assert!(!wire.is_local);
        assert_eq!(wire.local_data, LocalData::default());
    }

    #[test]
    fn batch_buffers_are_shared_not_copied() {
        // One "batch" allocation, two entries viewing disjoint ranges.
        let batch = Bytes::from(vec![1u8, 2, 3, 4, 5, 6]);
        let a = Entry::new_command(1, batch.slice(0..3));
        let b = Entry::new_command(1, batch.slice(3..6));

        let EntryPayload::Command(abuf) = &a.payload else { unreachable!() };
        let EntryPayload::Command(bbuf) = &b.payload else { unreachable!() };
        assert_eq!(&abuf[..], &[1, 2, 3]);
        assert_eq!(&bbuf[..], &[4, 5, 6]);

        // Dropping the batch handle must not invalidate the views.
        drop(batch);
        let EntryPayload::Command(abuf) = &a.payload else { unreachable!() };
        assert_eq!(&abuf[..], &[1, 2, 3]);
    }
}
