//! A deterministic in-process cluster for scenario tests.
//!
//! [`Fixture`] runs N [`RaftCore`]s against an in-memory disk and a
//! simulated network with a logical millisecond clock. Message delivery,
//! disk writes and background jobs are scheduled events with fixed
//! latencies, so every run of a scenario is reproducible. The election
//! safety invariant (at most one leader per term) is checked after every
//! step.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::config::Config;
use crate::core::bootstrap_state;
use crate::core::Effect;
use crate::core::RaftCore;
use crate::core::RequestId;
use crate::core::RequestOutput;
use crate::entry::Entry;
use crate::error::RaftError;
use crate::log::LogStore;
use crate::membership::Membership;
use crate::membership::Role;
use crate::message::Message;
use crate::snapshot::run_job;
use crate::snapshot::PageSet;
use crate::snapshot::WorkJob;
use crate::state_machine::StateMachine;
use crate::storage::InitialState;
use crate::storage::Snapshot;
use crate::LogIndex;
use crate::Millis;
use crate::NodeId;
use crate::ServerState;
use crate::Term;

/// Simulated one-way network latency.
pub const NETWORK_LATENCY: Millis = 2;
/// Simulated disk-write latency.
pub const DISK_LATENCY: Millis = 5;
/// Simulated background-job latency.
pub const WORK_LATENCY: Millis = 5;

/// A shared-handle page database used as the fixture's state machine:
/// applying a command appends its bytes to the content, snapshots are
/// the content split into pages.
#[derive(Clone, Default)]
pub struct PageDb {
    inner: Arc<Mutex<PageDbInner>>,
}

#[derive(Default)]
struct PageDbInner {
    content: Vec<u8>,
    applied: u64,
}

impl PageDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> Vec<u8> {
        self.inner.lock().unwrap().content.clone()
    }

    pub fn applied(&self) -> u64 {
        self.inner.lock().unwrap().applied
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.content.clear();
        inner.applied = 0;
    }
}

impl StateMachine for PageDb {
    fn apply(&mut self, _index: LogIndex, entry: &Entry) -> Bytes {
        let crate::entry::EntryPayload::Command(data) = &entry.payload else {
            return Bytes::new();
        };
        let mut inner = self.inner.lock().unwrap();
        inner.content.extend_from_slice(data);
        inner.applied += 1;
        data.clone()
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

/// The in-memory "disk" behind one server.
#[derive(Default)]
struct MemDisk {
    term: Term,
    voted_for: Option<NodeId>,
    log: LogStore,
    snapshot: Option<Snapshot>,
}

impl MemDisk {
    fn from_initial(state: &InitialState) -> Self {
        let snapshot_anchor = state.snapshot.as_ref().map(|s| (s.meta.last_log_id.index, s.meta.last_log_id.term));
        MemDisk {
            term: state.term,
            voted_for: state.voted_for,
            log: LogStore::load(snapshot_anchor, state.start_index, state.entries.clone()),
            snapshot: state.snapshot.clone(),
        }
    }

    fn to_initial(&self) -> InitialState {
        let first = self.log.first_index();
        let mut entries = Vec::new();
        if first > 0 {
            for index in first..=self.log.last_index() {
                entries.push(self.log.get(index).expect("in range").clone());
            }
        }
        InitialState {
            term: self.term,
            voted_for: self.voted_for,
            snapshot: self.snapshot.clone(),
            start_index: if first > 0 { first } else { self.log.last_index() + 1 },
            entries,
        }
    }
}

enum Pending {
    Deliver { to: NodeId, from: NodeId, message: Message },
    SendDone { on: NodeId, generation: u32, send_id: u64, ok: bool },
    AppendDone { on: NodeId, generation: u32, entries: Vec<Entry>, first_index: LogIndex },
    SnapshotPutDone { on: NodeId, generation: u32, trailing: u64, snapshot: Snapshot },
    SnapshotGot { on: NodeId, generation: u32, peer: NodeId },
    WorkDone { on: NodeId, generation: u32, work_id: u64, job: WorkJob },
}

struct ServerHarness {
    id: NodeId,
    core: RaftCore,
    disk: MemDisk,
    db: PageDb,
    alive: bool,
    generation: u32,
}

/// N servers, a logical clock and a scripted network.
pub struct Fixture {
    servers: Vec<ServerHarness>,
    now: Millis,
    events: BTreeMap<(Millis, u64), Pending>,
    next_seq: u64,
    next_request: RequestId,
    completed: HashMap<RequestId, Result<RequestOutput, RaftError>>,
    /// Directed pairs that cannot talk.
    cut: HashSet<(NodeId, NodeId)>,
    leaders_per_term: HashMap<Term, NodeId>,
    config: Config,
    seed: u64,
}

impl Fixture {
    /// A cluster of `n` voters, bootstrapped and started.
    pub fn new(n: usize) -> Self {
        Self::with_config(n, Config::default())
    }

    pub fn with_config(n: usize, config: Config) -> Self {
        let mut membership = Membership::new();
        for id in 1..=n as NodeId {
            membership.add(id, &format!("addr-{id}"), Role::Voter).unwrap();
        }

        let seed = 42;
        let mut fixture = Fixture {
            servers: Vec::new(),
            now: 0,
            events: BTreeMap::new(),
            next_seq: 0,
            next_request: 1,
            completed: HashMap::new(),
            cut: HashSet::new(),
            leaders_per_term: HashMap::new(),
            config,
            seed,
        };
        for id in 1..=n as NodeId {
            fixture.add_harness(id, bootstrap_state(membership.clone()));
        }
        fixture
    }

    /// Add one more server whose disk holds `initial`. Used both at
    /// construction and to grow a cluster mid-test.
    pub fn add_harness(&mut self, id: NodeId, initial: InitialState) {
        let db = PageDb::new();
        let mut core = RaftCore::new(
            id,
            &format!("addr-{id}"),
            self.config.clone(),
            Box::new(db.clone()),
            self.seed + id,
        );
        core.start(initial.clone_for_start(), self.now);
        let mut harness =
            ServerHarness { id, core, disk: MemDisk::from_initial(&initial), db, alive: true, generation: 0 };
        let effects = harness.core.take_effects();
        self.servers.push(harness);
        self.handle_effects(id, effects);
    }

    // ------------------------------------------------------------------
    // Clock.

    pub fn now(&self) -> Millis {
        self.now
    }

    /// Advance the logical clock by `ms`, one millisecond at a time:
    /// fire due events, tick every live server, check election safety.
    pub fn step(&mut self, ms: Millis) {
        for _ in 0..ms {
            self.now += 1;

            while let Some(entry) = self.events.first_entry() {
                if entry.key().0 > self.now {
                    break;
                }
                let (_, pending) = entry.remove_entry();
                self.fire(pending);
            }

            for i in 0..self.servers.len() {
                if !self.servers[i].alive {
                    continue;
                }
                let id = self.servers[i].id;
                self.servers[i].core.tick(self.now);
                let effects = self.servers[i].core.take_effects();
                self.handle_effects(id, effects);
            }

            self.check_election_safety();
        }
    }

    /// Step until `pred` holds, failing the test after `max_ms`.
    pub fn step_until(&mut self, max_ms: Millis, mut pred: impl FnMut(&Fixture) -> bool) {
        let deadline = self.now + max_ms;
        while self.now < deadline {
            if pred(self) {
                return;
            }
            self.step(1);
        }
        assert!(pred(self), "condition not reached within {max_ms}ms");
    }

    /// Make server `id` campaign right now and step until it leads.
    pub fn elect(&mut self, id: NodeId) {
        let i = self.index(id);
        assert!(self.servers[i].alive);
        assert_ne!(self.state(id), ServerState::Leader);
        self.servers[i].core.convert_to_candidate(false);
        let effects = self.servers[i].core.take_effects();
        self.handle_effects(id, effects);
        self.step_until(2 * self.config.election_timeout, |f| f.state(id) == ServerState::Leader);
    }

    // ------------------------------------------------------------------
    // Fault injection.

    pub fn kill(&mut self, id: NodeId) {
        let i = self.index(id);
        self.servers[i].alive = false;
        self.servers[i].generation += 1;
    }

    /// Restart a killed server from its disk; volatile state is gone and
    /// the database is rewound to the last snapshot.
    pub fn restart(&mut self, id: NodeId) {
        let i = self.index(id);
        assert!(!self.servers[i].alive, "restart requires a killed server");
        let initial = self.servers[i].disk.to_initial();
        self.servers[i].db.reset();
        let mut core = RaftCore::new(
            id,
            &format!("addr-{id}"),
            self.config.clone(),
            Box::new(self.servers[i].db.clone()),
            self.seed + id + u64::from(self.servers[i].generation),
        );
        core.start(initial, self.now);
        self.servers[i].core = core;
        self.servers[i].alive = true;
        self.servers[i].generation += 1;
        let effects = self.servers[i].core.take_effects();
        self.handle_effects(id, effects);
    }

    /// Cut both directions between two servers.
    pub fn disconnect(&mut self, a: NodeId, b: NodeId) {
        self.cut.insert((a, b));
        self.cut.insert((b, a));
    }

    pub fn reconnect(&mut self, a: NodeId, b: NodeId) {
        self.cut.remove(&(a, b));
        self.cut.remove(&(b, a));
    }

    /// Isolate a server from everyone.
    pub fn isolate(&mut self, id: NodeId) {
        for other in self.ids() {
            if other != id {
                self.disconnect(id, other);
            }
        }
    }

    pub fn restore_link(&mut self, id: NodeId) {
        for other in self.ids() {
            if other != id {
                self.reconnect(id, other);
            }
        }
    }

    // ------------------------------------------------------------------
    // API requests.

    pub fn submit_write(&mut self, id: NodeId, data: &[u8]) -> RequestId {
        let request = self.alloc_request();
        let i = self.index(id);
        self.servers[i].core.client_write(request, Bytes::copy_from_slice(data), self.now);
        self.drain(id);
        request
    }

    pub fn submit_barrier(&mut self, id: NodeId) -> RequestId {
        let request = self.alloc_request();
        let i = self.index(id);
        self.servers[i].core.barrier(request, self.now);
        self.drain(id);
        request
    }

    pub fn submit_add_server(&mut self, id: NodeId, new_id: NodeId, address: &str) -> RequestId {
        let request = self.alloc_request();
        let i = self.index(id);
        self.servers[i].core.add_server(request, new_id, address, self.now);
        self.drain(id);
        request
    }

    pub fn submit_assign(&mut self, id: NodeId, target: NodeId, role: Role) -> RequestId {
        let request = self.alloc_request();
        let i = self.index(id);
        self.servers[i].core.assign(request, target, role, self.now);
        self.drain(id);
        request
    }

    pub fn submit_remove_server(&mut self, id: NodeId, target: NodeId) -> RequestId {
        let request = self.alloc_request();
        let i = self.index(id);
        self.servers[i].core.remove_server(request, target, self.now);
        self.drain(id);
        request
    }

    pub fn submit_transfer(&mut self, id: NodeId, target: NodeId) -> RequestId {
        let request = self.alloc_request();
        let i = self.index(id);
        self.servers[i].core.transfer_leadership(request, target, self.now);
        self.drain(id);
        request
    }

    /// The completion of a submitted request, if it has fired.
    pub fn request_result(&self, request: RequestId) -> Option<&Result<RequestOutput, RaftError>> {
        self.completed.get(&request)
    }

    // ------------------------------------------------------------------
    // Observers.

    pub fn ids(&self) -> Vec<NodeId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    pub fn state(&self, id: NodeId) -> ServerState {
        self.servers[self.index(id)].core.state()
    }

    pub fn current_term(&self, id: NodeId) -> Term {
        self.servers[self.index(id)].core.current_term()
    }

    pub fn commit_index(&self, id: NodeId) -> LogIndex {
        self.servers[self.index(id)].core.commit_index()
    }

    pub fn last_applied(&self, id: NodeId) -> LogIndex {
        self.servers[self.index(id)].core.last_applied()
    }

    pub fn last_log_index(&self, id: NodeId) -> LogIndex {
        self.servers[self.index(id)].core.last_log_index()
    }

    pub fn voter_contacts(&self, id: NodeId) -> usize {
        self.servers[self.index(id)].core.voter_contacts()
    }

    pub fn membership(&self, id: NodeId) -> &Membership {
        self.servers[self.index(id)].core.membership()
    }

    pub fn core(&self, id: NodeId) -> &RaftCore {
        &self.servers[self.index(id)].core
    }

    pub fn db(&self, id: NodeId) -> &PageDb {
        &self.servers[self.index(id)].db
    }

    /// The single live leader, if any.
    pub fn leader(&self) -> Option<NodeId> {
        let mut found = None;
        for server in &self.servers {
            if server.alive && server.core.state() == ServerState::Leader {
                assert!(found.is_none(), "two live leaders");
                found = Some(server.id);
            }
        }
        found
    }

    pub fn has_leader(&self) -> bool {
        self.leader().is_some()
    }

    // ------------------------------------------------------------------
    // Internals.

    fn index(&self, id: NodeId) -> usize {
        self.servers.iter().position(|s| s.id == id).expect("unknown server id")
    }

    fn alloc_request(&mut self) -> RequestId {
        let request = self.next_request;
        self.next_request += 1;
        request
    }

    fn drain(&mut self, id: NodeId) {
        let i = self.index(id);
        let effects = self.servers[i].core.take_effects();
        self.handle_effects(id, effects);
    }

    fn schedule(&mut self, at: Millis, pending: Pending) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.insert((at.max(self.now + 1), seq), pending);
    }

    fn link_up(&self, from: NodeId, to: NodeId) -> bool {
        !self.cut.contains(&(from, to))
    }

    fn handle_effects(&mut self, id: NodeId, effects: Vec<Effect>) {
        let i = self.index(id);
        let generation = self.servers[i].generation;
        for effect in effects {
            match effect {
                Effect::Send { id: send_id, to, message, .. } => {
                    let deliverable =
                        self.link_up(id, to) && self.servers.iter().any(|s| s.id == to && s.alive);
                    self.schedule(self.now + 1, Pending::SendDone { on: id, generation, send_id, ok: deliverable });
                    if deliverable {
                        self.schedule(self.now + NETWORK_LATENCY, Pending::Deliver { to, from: id, message });
                    }
                }
                Effect::Append { first_index, entries } => {
                    self.schedule(
                        self.now + DISK_LATENCY,
                        Pending::AppendDone { on: id, generation, entries, first_index },
                    );
                }
                Effect::Truncate { from } => {
                    self.servers[i].disk.log.truncate(from);
                }
                Effect::SetTerm { term } => {
                    self.servers[i].disk.term = term;
                }
                Effect::SetVote { voted_for } => {
                    self.servers[i].disk.voted_for = voted_for;
                }
                Effect::SnapshotPut { trailing, snapshot } => {
                    self.schedule(
                        self.now + DISK_LATENCY,
                        Pending::SnapshotPutDone { on: id, generation, trailing, snapshot },
                    );
                }
                Effect::SnapshotGet { peer } => {
                    self.schedule(self.now + DISK_LATENCY, Pending::SnapshotGot { on: id, generation, peer });
                }
                Effect::StartWork { id: work_id, job } => {
                    self.schedule(self.now + WORK_LATENCY, Pending::WorkDone { on: id, generation, work_id, job });
                }
                Effect::RequestDone { request, result } => {
                    self.completed.insert(request, result);
                }
                Effect::StateChange { .. } => {}
            }
        }
    }

    fn fire(&mut self, pending: Pending) {
        match pending {
            Pending::Deliver { to, from, message } => {
                let i = self.index(to);
                if !self.servers[i].alive || !self.link_up(from, to) {
                    return;
                }
                self.servers[i].core.step(from, message, self.now);
                self.drain(to);
            }
            Pending::SendDone { on, generation, send_id, ok } => {
                let i = self.index(on);
                if !self.servers[i].alive || self.servers[i].generation != generation {
                    return;
                }
                let result = if ok { Ok(()) } else { Err(crate::error::NetworkError::NoConnection { target: 0 }) };
                self.servers[i].core.send_done(send_id, result, self.now);
                self.drain(on);
            }
            Pending::AppendDone { on, generation, entries, first_index } => {
                let i = self.index(on);
                if self.servers[i].generation != generation {
                    return;
                }
                // The write itself lands even if the server died after
                // issuing it; the completion is only delivered alive.
                for (offset, entry) in entries.into_iter().enumerate() {
                    let index = first_index + offset as LogIndex;
                    if index <= self.servers[i].disk.log.snapshot_last_index() {
                        // A snapshot written in the meantime covers it.
                        continue;
                    }
                    if self.servers[i].disk.log.last_index() >= index {
                        self.servers[i].disk.log.truncate(index);
                    }
                    self.servers[i].disk.log.append(entry);
                }
                if !self.servers[i].alive {
                    return;
                }
                self.servers[i].core.append_done(Ok(()), self.now);
                self.drain(on);
            }
            Pending::SnapshotPutDone { on, generation, trailing, snapshot } => {
                let i = self.index(on);
                if self.servers[i].generation != generation {
                    return;
                }
                let last = snapshot.meta.last_log_id;
                self.servers[i].disk.snapshot = Some(snapshot);
                if self.servers[i].disk.log.last_index() >= last.index && self.servers[i].disk.log.term_of(last.index) == last.term {
                    let _ = self.servers[i].disk.log.snapshot(last.index, trailing);
                } else {
                    self.servers[i].disk.log.restore(last.index, last.term);
                }
                if !self.servers[i].alive {
                    return;
                }
                self.servers[i].core.snapshot_put_done(Ok(()), self.now);
                self.drain(on);
            }
            Pending::SnapshotGot { on, generation, peer } => {
                let i = self.index(on);
                if !self.servers[i].alive || self.servers[i].generation != generation {
                    return;
                }
                let snapshot = self.servers[i].disk.snapshot.clone();
                self.servers[i].core.snapshot_got(peer, snapshot, self.now);
                self.drain(on);
            }
            Pending::WorkDone { on, generation, work_id, job } => {
                let i = self.index(on);
                if !self.servers[i].alive || self.servers[i].generation != generation {
                    return;
                }
                let output = run_job(job);
                self.servers[i].core.work_done(work_id, output, self.now);
                self.drain(on);
            }
        }
    }

    /// At most one leader per term, across everything we have ever seen.
    fn check_election_safety(&mut self) {
        for server in &self.servers {
            if !server.alive || server.core.state() != ServerState::Leader {
                continue;
            }
            let term = server.core.current_term();
            match self.leaders_per_term.get(&term) {
                None => {
                    self.leaders_per_term.insert(term, server.id);
                }
                Some(existing) => {
                    assert_eq!(*existing, server.id, "two leaders elected in term {term}");
                }
            }
        }
    }
}

impl InitialState {
    /// The fixture hands the same initial state to the disk and the
    /// core.
    fn clone_for_start(&self) -> InitialState {
        InitialState {
            term: self.term,
            voted_for: self.voted_for,
            snapshot: self.snapshot.clone(),
            start_index: self.start_index,
            entries: self.entries.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_elects_a_leader() {
        let mut fixture = Fixture::new(3);
        fixture.step_until(5000, |f| f.has_leader());
        let leader = fixture.leader().unwrap();
        assert_eq!(fixture.state(leader), ServerState::Leader);
    }

    #[test]
    fn page_db_applies_commands() {
        let db = PageDb::new();
        let mut fsm: Box<dyn StateMachine> = Box::new(db.clone());
        let entry = Entry::new_command(1, Bytes::from_static(b"hello"));
        let response = fsm.apply(1, &entry);
        assert_eq!(&response[..], b"hello");
        assert_eq!(db.content(), b"hello");
        assert_eq!(db.applied(), 1);
    }
}
