//! The in-memory log store.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::entry::Entry;
use crate::error::RaftError;
use crate::LogIndex;
use crate::Term;

/// Initial capacity of the reference-count table.
const REFS_INITIAL_CAPACITY: usize = 256;

/// In-memory sequence of log entries with per-entry reference counts and a
/// snapshot anchor.
///
/// Entries are keyed by a 1-based, gap-free `index`. The entry payloads are
/// [`bytes::Bytes`] views, so a batch received in one AppendEntries message
/// keeps sharing one allocation; the explicit reference counts kept here
/// additionally make the sharing observable: a slice handed out by
/// [`LogStore::acquire`] stays valid across [`LogStore::truncate`] and
/// [`LogStore::snapshot`], and the count returns to its prior value once
/// the slice is released.
///
/// Reference counts are keyed by `(term, index)`: after a truncation, a new
/// entry appended at a recycled index necessarily has a different term, so
/// outstanding references to the old entry never collide with the new one.
#[derive(Debug, Default)]
pub struct LogStore {
    /// Retained entries; `entries[0]` has index `offset + 1`.
    entries: VecDeque<Entry>,
    offset: LogIndex,

    /// Index and term of the last entry covered by the most recent
    /// snapshot, or zero when no snapshot was taken.
    snapshot_last_index: LogIndex,
    snapshot_last_term: Term,

    refs: HashMap<(Term, LogIndex), usize>,
}

impl LogStore {
    pub fn new() -> Self {
        LogStore {
            entries: VecDeque::new(),
            offset: 0,
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            refs: HashMap::with_capacity(REFS_INITIAL_CAPACITY),
        }
    }

    /// Initialize from persisted state: the snapshot anchor (if any), the
    /// index of the first persisted entry, and the persisted entries.
    pub fn load(snapshot: Option<(LogIndex, Term)>, start_index: LogIndex, entries: Vec<Entry>) -> Self {
        let mut log = LogStore::new();
        if let Some((index, term)) = snapshot {
            log.snapshot_last_index = index;
            log.snapshot_last_term = term;
        }
        log.offset = start_index.saturating_sub(1);
        for entry in entries {
            let index = log.offset + log.entries.len() as LogIndex + 1;
            log.refs.insert((entry.term, index), 1);
            log.entries.push_back(entry);
        }
        log
    }

    /// Index of the last entry, or of the snapshot anchor when the log
    /// holds no entries. Zero means the log is empty.
    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.snapshot_last_index.max(self.offset)
        } else {
            self.offset + self.entries.len() as LogIndex
        }
    }

    /// Term of the last entry, falling back to the snapshot anchor.
    pub fn last_term(&self) -> Term {
        self.term_of(self.last_index())
    }

    /// Index of the first retained entry; zero when none are retained.
    pub fn first_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            0
        } else {
            self.offset + 1
        }
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot_last_index(&self) -> LogIndex {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> Term {
        self.snapshot_last_term
    }

    /// Term of the entry at `index`.
    ///
    /// Returns the snapshot anchor's term for the anchor index even when
    /// the entry itself is no longer retained, and zero for any other
    /// index outside the retained range.
    pub fn term_of(&self, index: LogIndex) -> Term {
        if index == 0 {
            return 0;
        }
        if let Some(entry) = self.get(index) {
            return entry.term;
        }
        if index == self.snapshot_last_index {
            return self.snapshot_last_term;
        }
        0
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index <= self.offset {
            return None;
        }
        self.entries.get((index - self.offset - 1) as usize)
    }

    /// Append a new entry at `last_index() + 1`, with one reference held
    /// by the store itself.
    pub fn append(&mut self, entry: Entry) -> LogIndex {
        if self.entries.is_empty() {
            // Re-anchor so the next entry lands right after the snapshot.
            self.offset = self.last_index();
        }
        let index = self.offset + self.entries.len() as LogIndex + 1;
        self.refs.insert((entry.term, index), 1);
        self.entries.push_back(entry);
        index
    }

    /// Take a slice of entries starting at `index`, up to `limit` entries
    /// or the log end, incrementing the reference count of each.
    ///
    /// Returns an empty vector when `index` is outside the retained range.
    /// The returned entries stay valid across truncation and snapshot
    /// until they are passed back to [`LogStore::release`].
    pub fn acquire(&mut self, index: LogIndex, limit: usize) -> Vec<Entry> {
        if index < self.first_index() || index > self.last_index() || self.entries.is_empty() {
            return Vec::new();
        }
        let start = (index - self.offset - 1) as usize;
        let end = self.entries.len().min(start + limit);
        let mut acquired = Vec::with_capacity(end - start);
        for i in start..end {
            let entry = &self.entries[i];
            let key = (entry.term, self.offset + i as LogIndex + 1);
            *self.refs.entry(key).or_insert(0) += 1;
            acquired.push(entry.clone());
        }
        acquired
    }

    /// Release a slice previously returned by [`LogStore::acquire`],
    /// where `index` is the index of the first entry of the slice.
    pub fn release(&mut self, index: LogIndex, entries: &[Entry]) {
        for (i, entry) in entries.iter().enumerate() {
            self.unref(entry.term, index + i as LogIndex);
        }
    }

    /// Outstanding references to the entry `(term, index)`, including the
    /// store's own reference while the entry is retained.
    pub fn ref_count(&self, term: Term, index: LogIndex) -> usize {
        self.refs.get(&(term, index)).copied().unwrap_or(0)
    }

    /// Remove all entries with index >= `from`. A no-op when `from` is
    /// past the log end. References already acquired remain valid until
    /// released; the vacated slots are independent of any future appends.
    pub fn truncate(&mut self, from: LogIndex) {
        debug_assert!(from > self.snapshot_last_index, "cannot truncate into the snapshot");
        if from > self.last_index() {
            return;
        }
        let keep = from.saturating_sub(self.offset + 1) as usize;
        while self.entries.len() > keep {
            let index = self.offset + self.entries.len() as LogIndex;
            let entry = self.entries.pop_back().expect("len > keep");
            self.unref(entry.term, index);
        }
    }

    /// Advance the snapshot anchor to `last_index`, retaining at most
    /// `trailing` entries before it. Fails when `last_index` is not a
    /// stored entry or would move the anchor backwards.
    pub fn snapshot(&mut self, last_index: LogIndex, trailing: u64) -> Result<(), RaftError> {
        if last_index > self.last_index() || last_index < self.snapshot_last_index {
            return Err(RaftError::Invalid);
        }
        let last_term = self.term_of(last_index);
        if last_term == 0 {
            return Err(RaftError::Invalid);
        }
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;

        // Keep entries in (last_index - trailing, last_index] and anything
        // after the anchor; drop the rest from the front.
        let new_first = last_index.saturating_sub(trailing) + 1;
        while !self.entries.is_empty() && self.first_index() < new_first {
            let index = self.offset + 1;
            let entry = self.entries.pop_front().expect("not empty");
            self.offset += 1;
            self.unref(entry.term, index);
        }
        Ok(())
    }

    /// Reset to an empty log positioned right after a restored snapshot.
    pub fn restore(&mut self, last_index: LogIndex, last_term: Term) {
        while let Some(entry) = self.entries.pop_back() {
            let index = self.offset + self.entries.len() as LogIndex + 1;
            self.unref(entry.term, index);
        }
        self.offset = last_index;
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
    }

    fn unref(&mut self, term: Term, index: LogIndex) {
        let count = self.refs.get_mut(&(term, index)).expect("reference count present");
        *count -= 1;
        if *count == 0 {
            self.refs.remove(&(term, index));
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::EntryPayload;

    fn command(term: Term, data: &'static [u8]) -> Entry {
        Entry::new_command(term, Bytes::from_static(data))
    }

    fn append_n(log: &mut LogStore, term: Term, n: usize) {
        for _ in 0..n {
            log.append(command(term, b"x"));
        }
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut log = LogStore::new();
        for i in 1..=10u64 {
            let index = log.append(command(1, b"payload"));
            assert_eq!(index, i);
        }
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.num_entries(), 10);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.term_of(10), 1);
        assert_eq!(log.term_of(11), 0);
    }

    #[test]
    fn acquire_and_release_restore_ref_counts() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 5);
        assert_eq!(log.ref_count(1, 3), 1);

        let acquired = log.acquire(3, usize::MAX);
        assert_eq!(acquired.len(), 3);
        assert_eq!(log.ref_count(1, 3), 2);

        log.release(3, &acquired);
        assert_eq!(log.ref_count(1, 3), 1);
    }

    #[test]
    fn acquire_outside_range_is_empty() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 2);
        assert!(log.acquire(3, usize::MAX).is_empty());
        assert!(log.acquire(0, usize::MAX).is_empty());
        assert!(LogStore::new().acquire(1, usize::MAX).is_empty());
    }

    #[test]
    fn acquire_respects_limit() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 8);
        let acquired = log.acquire(2, 3);
        assert_eq!(acquired.len(), 3);
        log.release(2, &acquired);
    }

    #[test]
    fn truncate_past_end_is_a_noop() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 3);
        log.truncate(7);
        assert_eq!(log.num_entries(), 3);
    }

    #[test]
    fn truncate_keeps_acquired_slices_valid() {
        let mut log = LogStore::new();
        log.append(command(1, b"one"));
        log.append(command(1, b"two"));

        let acquired = log.acquire(1, usize::MAX);
        log.truncate(1);
        assert_eq!(log.num_entries(), 0);

        // The slice is still readable and the counts drop only on release.
        assert_eq!(acquired.len(), 2);
        let EntryPayload::Command(buf) = &acquired[0].payload else { panic!() };
        assert_eq!(&buf[..], b"one");
        assert_eq!(log.ref_count(1, 1), 1);

        log.release(1, &acquired);
        assert_eq!(log.ref_count(1, 1), 0);
    }

    #[test]
    fn append_after_truncate_is_independent() {
        let mut log = LogStore::new();
        log.append(command(1, b"old"));
        let acquired = log.acquire(1, usize::MAX);

        log.truncate(1);
        let index = log.append(command(2, b"new"));
        assert_eq!(index, 1);

        // Old and new coexist under different terms.
        assert_eq!(log.ref_count(1, 1), 1);
        assert_eq!(log.ref_count(2, 1), 1);
        log.release(1, &acquired);
        assert_eq!(log.ref_count(1, 1), 0);
        assert_eq!(log.term_of(1), 2);
    }

    #[test]
    fn snapshot_trailing_retention() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 10);

        log.snapshot(8, 3).unwrap();
        // Entries 6..=10 remain: 3 trailing plus the two after the anchor.
        assert_eq!(log.num_entries(), 5);
        assert_eq!(log.first_index(), 6);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.snapshot_last_index(), 8);
        assert_eq!(log.snapshot_last_term(), 1);

        // Below trailing retention the term is gone.
        assert_eq!(log.term_of(5), 0);
        assert_eq!(log.term_of(6), 1);
    }

    #[test]
    fn snapshot_with_large_trailing_keeps_everything() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 4);
        log.snapshot(4, 100).unwrap();
        assert_eq!(log.num_entries(), 4);
    }

    #[test]
    fn snapshot_beyond_last_index_errors() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 3);
        assert_eq!(log.snapshot(4, 0), Err(RaftError::Invalid));
    }

    #[test]
    fn snapshot_anchor_term_survives_full_drop() {
        let mut log = LogStore::new();
        append_n(&mut log, 3, 5);
        log.snapshot(5, 0).unwrap();
        assert_eq!(log.num_entries(), 0);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_of(5), 3);
        assert_eq!(log.term_of(4), 0);

        // Appends continue right after the anchor.
        let index = log.append(command(4, b"x"));
        assert_eq!(index, 6);
    }

    #[test]
    fn restore_resets_to_anchor() {
        let mut log = LogStore::new();
        append_n(&mut log, 1, 3);
        log.restore(100, 7);
        assert_eq!(log.num_entries(), 0);
        assert_eq!(log.last_index(), 100);
        assert_eq!(log.last_term(), 7);
        assert_eq!(log.append(command(8, b"x")), 101);
    }

    #[test]
    fn load_from_persisted_state() {
        let entries = vec![command(2, b"a"), command(2, b"b")];
        let log = LogStore::load(Some((10, 2)), 11, entries);
        assert_eq!(log.first_index(), 11);
        assert_eq!(log.last_index(), 12);
        assert_eq!(log.term_of(10), 2);
        assert_eq!(log.term_of(12), 2);
        assert_eq!(log.ref_count(2, 11), 1);
    }
}
