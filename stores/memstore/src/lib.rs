//! In-memory implementations of the pageraft storage and state-machine
//! collaborators, for tests and examples.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use pageraft::entry::Entry;
use pageraft::entry::EntryPayload;
use pageraft::error::StorageError;
use pageraft::membership::Membership;
use pageraft::snapshot::PageSet;
use pageraft::state_machine::StateMachine;
use pageraft::storage::InitialState;
use pageraft::storage::RaftStorage;
use pageraft::storage::Snapshot;
use pageraft::LogIndex;
use pageraft::NodeId;
use pageraft::Term;

/// Volatile storage: everything a real store would put on disk, kept in
/// maps. "Durability" is immediate.
#[derive(Default)]
pub struct MemStore {
    term: Term,
    voted_for: Option<NodeId>,
    entries: BTreeMap<LogIndex, Entry>,
    snapshot: Option<Snapshot>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.keys().next_back().copied().unwrap_or_else(|| {
            self.snapshot.as_ref().map(|s| s.meta.last_log_id.index).unwrap_or(0)
        })
    }

    fn is_pristine(&self) -> bool {
        self.term == 0 && self.voted_for.is_none() && self.entries.is_empty() && self.snapshot.is_none()
    }
}

#[async_trait]
impl RaftStorage for MemStore {
    async fn load(&mut self) -> Result<InitialState, StorageError> {
        let start_index = self.entries.keys().next().copied().unwrap_or_else(|| self.last_index() + 1);
        Ok(InitialState {
            term: self.term,
            voted_for: self.voted_for,
            snapshot: self.snapshot.clone(),
            start_index,
            entries: self.entries.values().cloned().collect(),
        })
    }

    async fn set_term(&mut self, term: Term) -> Result<(), StorageError> {
        self.term = term;
        Ok(())
    }

    async fn set_vote(&mut self, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.voted_for = voted_for;
        Ok(())
    }

    async fn append(&mut self, first_index: LogIndex, entries: Vec<Entry>) -> Result<(), StorageError> {
        for (offset, entry) in entries.into_iter().enumerate() {
            self.entries.insert(first_index + offset as LogIndex, entry);
        }
        Ok(())
    }

    async fn truncate(&mut self, from: LogIndex) -> Result<(), StorageError> {
        self.entries.split_off(&from);
        Ok(())
    }

    async fn snapshot_put(&mut self, trailing: u64, snapshot: Snapshot) -> Result<(), StorageError> {
        let last = snapshot.meta.last_log_id.index;
        let keep_from = last.saturating_sub(trailing) + 1;
        self.entries = self.entries.split_off(&keep_from);
        self.snapshot = Some(snapshot);
        Ok(())
    }

    async fn snapshot_get(&mut self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    async fn bootstrap(&mut self, membership: Membership) -> Result<(), StorageError> {
        if !self.is_pristine() {
            return Err(StorageError::Io(anyerror_msg("store is not pristine")));
        }
        self.term = 1;
        self.entries.insert(1, Entry::new_membership(1, membership));
        Ok(())
    }

    async fn recover(&mut self, membership: Membership) -> Result<(), StorageError> {
        let index = self.last_index() + 1;
        let term = self.term.max(1);
        self.entries.insert(index, Entry::new_membership(term, membership));
        Ok(())
    }
}

fn anyerror_msg(msg: &str) -> anyerror::AnyError {
    anyerror::AnyError::error(msg)
}

/// A shared-handle state machine that concatenates applied commands; its
/// snapshot content is the concatenation split into pages.
#[derive(Clone, Default)]
pub struct MemStateMachine {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    content: Vec<u8>,
    last_applied: LogIndex,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> Vec<u8> {
        self.inner.lock().unwrap().content.clone()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.lock().unwrap().last_applied
    }
}

impl StateMachine for MemStateMachine {
    fn apply(&mut self, index: LogIndex, entry: &Entry) -> Bytes {
        let mut inner = self.inner.lock().unwrap();
        inner.last_applied = index;
        match &entry.payload {
            EntryPayload::Command(data) => {
                inner.content.extend_from_slice(data);
                data.clone()
            }
            _ => Bytes::new(),
        }
    }

    fn snapshot(&self, page_size: u32) -> PageSet {
        let inner = self.inner.lock().unwrap();
        PageSet::from_bytes(page_size, Bytes::from(inner.content.clone()))
    }

    fn restore(&mut self, pages: &PageSet) {
        let mut inner = self.inner.lock().unwrap();
        inner.content = pages.to_bytes().to_vec();
    }
}

#[cfg(test)]
mod tests {
    use pageraft::membership::Role;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn bootstrap_requires_pristine_store() {
        let mut store = MemStore::new();
        let mut membership = Membership::new();
        membership.add(1, "addr-1", Role::Voter).unwrap();

        store.bootstrap(membership.clone()).await.unwrap();
        assert_eq!(store.last_index(), 1);
        assert!(store.bootstrap(membership).await.is_err());
    }

    #[tokio::test]
    async fn load_roundtrips_appends() {
        let mut store = MemStore::new();
        store.set_term(3).await.unwrap();
        store
            .append(1, vec![Entry::new_command(3, Bytes::from_static(b"a")), Entry::new_command(3, Bytes::from_static(b"b"))])
            .await
            .unwrap();
        store.truncate(2).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.term, 3);
        assert_eq!(state.start_index, 1);
        assert_eq!(state.entries.len(), 1);
    }

    #[tokio::test]
    async fn recover_appends_a_configuration_entry() {
        let mut store = MemStore::new();
        let mut membership = Membership::new();
        membership.add(1, "addr-1", Role::Voter).unwrap();
        store.bootstrap(membership.clone()).await.unwrap();

        membership.add(2, "addr-2", Role::Voter).unwrap();
        store.recover(membership.clone()).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.entries.len(), 2);
        let last = state.entries.last().unwrap();
        match &last.payload {
            EntryPayload::Membership(m) => assert_eq!(*m, membership),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_put_compacts_the_log() {
        let mut store = MemStore::new();
        for index in 1..=10u64 {
            store.append(index, vec![Entry::new_command(1, Bytes::from_static(b"x"))]).await.unwrap();
        }

        let mut snapshot = pageraft::storage::Snapshot::default();
        snapshot.meta.last_log_id = pageraft::LogId::new(1, 8);
        store.snapshot_put(2, snapshot.clone()).await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.start_index, 7, "two trailing entries retained");
        assert_eq!(state.entries.len(), 4);
        assert_eq!(store.snapshot_get().await.unwrap(), Some(snapshot));
    }

    #[test]
    fn state_machine_snapshot_roundtrip() {
        let sm = MemStateMachine::new();
        let mut boxed: Box<dyn StateMachine> = Box::new(sm.clone());
        boxed.apply(1, &Entry::new_command(1, Bytes::from_static(b"hello ")));
        boxed.apply(2, &Entry::new_command(1, Bytes::from_static(b"world")));

        let pages = boxed.snapshot(4);
        assert_eq!(pages.page_count(), 3);

        let other = MemStateMachine::new();
        let mut other_boxed: Box<dyn StateMachine> = Box::new(other.clone());
        other_boxed.restore(&pages);
        assert_eq!(other.content(), b"hello world");
        assert_eq!(sm.last_applied(), 2);
    }
}
