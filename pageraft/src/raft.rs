//! The public async handle driving a [`RaftCore`] on a tokio task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::config::Config;
use crate::core::Effect;
use crate::core::RaftCore;
use crate::core::RequestId;
use crate::core::RequestOutput;
use crate::error::RaftError;
use crate::membership::Membership;
use crate::membership::Role;
use crate::message::Message;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::snapshot::run_job;
use crate::state_machine::StateMachine;
use crate::storage::RaftStorage;
use crate::Millis;
use crate::NodeId;

/// Time source for the driver. The default implementation reads a
/// monotonic clock; tests may substitute their own.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Millis;
}

/// Milliseconds since driver start.
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }
}

type ResultSender = oneshot::Sender<Result<RequestOutput, RaftError>>;

enum ApiMsg {
    Write { data: Bytes, tx: ResultSender },
    Barrier { tx: ResultSender },
    AddServer { id: NodeId, address: String, tx: ResultSender },
    Assign { id: NodeId, role: Role, tx: ResultSender },
    RemoveServer { id: NodeId, tx: ResultSender },
    Transfer { target: NodeId, tx: ResultSender },
    Inbound { from: NodeId, message: Message },
    Shutdown { tx: oneshot::Sender<()> },
}

enum Completion {
    SendDone { id: u64, ok: bool },
    WorkDone { id: u64, output: crate::snapshot::WorkOutput },
}

/// Check that the storage is pristine, then write the initial
/// configuration entry. Must run before [`Raft::new`].
pub async fn bootstrap(storage: &mut dyn RaftStorage, membership: Membership) -> Result<(), RaftError> {
    let state = storage.load().await.map_err(|e| e.code())?;
    if state.term != 0 || !state.entries.is_empty() || state.snapshot.is_some() {
        return Err(RaftError::CantBootstrap);
    }
    storage.bootstrap(membership).await.map_err(|e| e.code())
}

/// Force a new configuration onto a stopped server to recover from
/// quorum loss.
pub async fn recover(storage: &mut dyn RaftStorage, membership: Membership) -> Result<(), RaftError> {
    storage.recover(membership).await.map_err(|e| e.code())
}

/// An async handle to one raft server.
///
/// Cheap to clone; all clones talk to the same driver task. The driver
/// owns the core and the collaborators and shuts down when
/// [`Raft::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct Raft {
    tx: mpsc::UnboundedSender<ApiMsg>,
    metrics_rx: watch::Receiver<RaftMetrics>,
}

impl Raft {
    /// Load persisted state and start the driver task.
    pub async fn new(
        id: NodeId,
        address: &str,
        config: Config,
        network: Arc<dyn RaftNetwork>,
        mut storage: Box<dyn RaftStorage>,
        fsm: Box<dyn StateMachine>,
    ) -> Result<Raft, RaftError> {
        let initial = storage.load().await.map_err(|e| e.code())?;

        let clock = MonotonicClock::default();
        let mut core = RaftCore::new(id, address, config, fsm, rand::random());
        core.start(initial, clock.now());

        let (tx, rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(core.metrics());

        tokio::spawn(run_driver(core, storage, network, rx, metrics_tx, clock));
        Ok(Raft { tx, metrics_rx })
    }

    /// Propose an application command; resolves once committed and
    /// applied.
    pub async fn client_write(&self, data: Bytes) -> Result<RequestOutput, RaftError> {
        self.call(|tx| ApiMsg::Write { data, tx }).await
    }

    /// Resolves once every entry appended before it has been applied.
    pub async fn barrier(&self) -> Result<RequestOutput, RaftError> {
        self.call(|tx| ApiMsg::Barrier { tx }).await
    }

    /// Add a server to the cluster as a spare.
    pub async fn add_server(&self, id: NodeId, address: &str) -> Result<RequestOutput, RaftError> {
        let address = address.to_string();
        self.call(|tx| ApiMsg::AddServer { id, address, tx }).await
    }

    /// Change a server's role; promotions may require catch-up rounds.
    pub async fn assign(&self, id: NodeId, role: Role) -> Result<RequestOutput, RaftError> {
        self.call(|tx| ApiMsg::Assign { id, role, tx }).await
    }

    pub async fn remove_server(&self, id: NodeId) -> Result<RequestOutput, RaftError> {
        self.call(|tx| ApiMsg::RemoveServer { id, tx }).await
    }

    /// Transfer leadership to `target`, or to the most caught-up voter
    /// when `target` is zero.
    pub async fn transfer_leadership(&self, target: NodeId) -> Result<RequestOutput, RaftError> {
        self.call(|tx| ApiMsg::Transfer { target, tx }).await
    }

    /// Deliver a message received from the transport.
    pub fn handle_message(&self, from: NodeId, message: Message) {
        let _ = self.tx.send(ApiMsg::Inbound { from, message });
    }

    /// Watch the server's observable state.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics_rx.clone()
    }

    /// Stop the driver; pending requests complete with `shutdown`.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ApiMsg::Shutdown { tx }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn call(&self, make: impl FnOnce(ResultSender) -> ApiMsg) -> Result<RequestOutput, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }
}

async fn run_driver(
    mut core: RaftCore,
    mut storage: Box<dyn RaftStorage>,
    network: Arc<dyn RaftNetwork>,
    mut api_rx: mpsc::UnboundedReceiver<ApiMsg>,
    metrics_tx: watch::Sender<RaftMetrics>,
    clock: MonotonicClock,
) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
    let mut pending: HashMap<RequestId, ResultSender> = HashMap::new();
    let mut next_request: RequestId = 1;

    let mut tick = tokio::time::interval(Duration::from_millis(20));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let mut stop = None;

        tokio::select! {
            _ = tick.tick() => {
                core.tick(clock.now());
            }
            api = api_rx.recv() => match api {
                Some(ApiMsg::Write { data, tx }) => {
                    let request = next_request;
                    next_request += 1;
                    pending.insert(request, tx);
                    core.client_write(request, data, clock.now());
                }
                Some(ApiMsg::Barrier { tx }) => {
                    let request = next_request;
                    next_request += 1;
                    pending.insert(request, tx);
                    core.barrier(request, clock.now());
                }
                Some(ApiMsg::AddServer { id, address, tx }) => {
                    let request = next_request;
                    next_request += 1;
                    pending.insert(request, tx);
                    core.add_server(request, id, &address, clock.now());
                }
                Some(ApiMsg::Assign { id, role, tx }) => {
                    let request = next_request;
                    next_request += 1;
                    pending.insert(request, tx);
                    core.assign(request, id, role, clock.now());
                }
                Some(ApiMsg::RemoveServer { id, tx }) => {
                    let request = next_request;
                    next_request += 1;
                    pending.insert(request, tx);
                    core.remove_server(request, id, clock.now());
                }
                Some(ApiMsg::Transfer { target, tx }) => {
                    let request = next_request;
                    next_request += 1;
                    pending.insert(request, tx);
                    core.transfer_leadership(request, target, clock.now());
                }
                Some(ApiMsg::Inbound { from, message }) => {
                    core.step(from, message, clock.now());
                }
                Some(ApiMsg::Shutdown { tx }) => {
                    core.shutdown();
                    stop = Some(tx);
                }
                None => {
                    core.shutdown();
                    stop = Some(oneshot::channel().0);
                }
            },
            done = done_rx.recv() => match done {
                Some(Completion::SendDone { id, ok }) => {
                    let result = if ok { Ok(()) } else { Err(crate::error::NetworkError::Canceled) };
                    core.send_done(id, result, clock.now());
                }
                Some(Completion::WorkDone { id, output }) => {
                    core.work_done(id, output, clock.now());
                }
                None => unreachable!("driver holds a sender"),
            },
        }

        process_effects(&mut core, &mut storage, &network, &done_tx, &mut pending, &clock).await;
        let _ = metrics_tx.send(core.metrics());

        if let Some(tx) = stop {
            let _ = tx.send(());
            return;
        }
    }
}

/// Drain and perform effects until the core has nothing more to say.
/// Storage operations are awaited in place, which preserves both the
/// completion ordering and the set_term/set_vote durability rule; sends
/// and background jobs run concurrently and report back through the
/// completion channel.
async fn process_effects(
    core: &mut RaftCore,
    storage: &mut Box<dyn RaftStorage>,
    network: &Arc<dyn RaftNetwork>,
    done_tx: &mpsc::UnboundedSender<Completion>,
    pending: &mut HashMap<RequestId, ResultSender>,
    clock: &MonotonicClock,
) {
    loop {
        let effects = core.take_effects();
        if effects.is_empty() {
            return;
        }
        for effect in effects {
            match effect {
                Effect::Send { id, to, to_address, message } => {
                    let network = network.clone();
                    let done_tx = done_tx.clone();
                    tokio::spawn(async move {
                        let ok = network.send(to, &to_address, message).await.is_ok();
                        let _ = done_tx.send(Completion::SendDone { id, ok });
                    });
                }
                Effect::Append { first_index, entries } => {
                    let result = storage.append(first_index, entries).await;
                    core.append_done(result, clock.now());
                }
                Effect::Truncate { from } => {
                    if let Err(err) = storage.truncate(from).await {
                        tracing::warn!(error = %err, "storage truncate failed");
                    }
                }
                Effect::SetTerm { term } => {
                    if storage.set_term(term).await.is_err() {
                        core.fatal_storage();
                    }
                }
                Effect::SetVote { voted_for } => {
                    if storage.set_vote(voted_for).await.is_err() {
                        core.fatal_storage();
                    }
                }
                Effect::SnapshotPut { trailing, snapshot } => {
                    let result = storage.snapshot_put(trailing, snapshot).await;
                    core.snapshot_put_done(result, clock.now());
                }
                Effect::SnapshotGet { peer } => {
                    let snapshot = storage.snapshot_get().await.ok().flatten();
                    core.snapshot_got(peer, snapshot, clock.now());
                }
                Effect::StartWork { id, job } => {
                    let done_tx = done_tx.clone();
                    let handle = tokio::task::spawn_blocking(move || run_job(job));
                    tokio::spawn(async move {
                        if let Ok(output) = handle.await {
                            let _ = done_tx.send(Completion::WorkDone { id, output });
                        }
                    });
                }
                Effect::RequestDone { request, result } => {
                    if let Some(tx) = pending.remove(&request) {
                        let _ = tx.send(result);
                    }
                }
                Effect::StateChange { from, to } => {
                    tracing::debug!(from = %from, to = %to, "state changed");
                }
            }
        }
    }
}
