//! Driver-level tests: real tokio tasks over the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pageraft::config::Config;
use pageraft::error::NetworkError;
use pageraft::membership::Membership;
use pageraft::membership::Role;
use pageraft::message::Message;
use pageraft::network::RaftNetwork;
use pageraft::raft;
use pageraft::raft::Raft;
use pageraft::NodeId;
use pageraft::ServerState;
use pageraft_memstore::MemStateMachine;
use pageraft_memstore::MemStore;

/// Routes messages straight into the target's driver task.
struct Router {
    me: NodeId,
    registry: Arc<Mutex<HashMap<NodeId, Raft>>>,
}

#[async_trait]
impl RaftNetwork for Router {
    async fn send(&self, target: NodeId, _address: &str, message: Message) -> Result<(), NetworkError> {
        let handle = self.registry.lock().unwrap().get(&target).cloned();
        match handle {
            Some(raft) => {
                raft.handle_message(self.me, message);
                Ok(())
            }
            None => Err(NetworkError::NoConnection { target }),
        }
    }
}

fn test_config() -> Config {
    Config::build(&["pageraft", "--election-timeout", "300", "--heartbeat-timeout", "50"]).unwrap()
}

fn single_node_membership() -> Membership {
    let mut membership = Membership::new();
    membership.add(1, "addr-1", Role::Voter).unwrap();
    membership
}

async fn wait_for_leader(rafts: &HashMap<NodeId, Raft>, timeout: Duration) -> NodeId {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for raft in rafts.values() {
            let metrics = raft.metrics().borrow().clone();
            if metrics.state == ServerState::Leader {
                return metrics.id;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_elects_itself_and_applies() {
    let mut storage = MemStore::new();
    raft::bootstrap(&mut storage, single_node_membership()).await.unwrap();

    let registry: Arc<Mutex<HashMap<NodeId, Raft>>> = Arc::default();
    let network = Arc::new(Router { me: 1, registry: registry.clone() });
    let fsm = MemStateMachine::new();

    let raft = Raft::new(1, "addr-1", test_config(), network, Box::new(storage), Box::new(fsm.clone()))
        .await
        .unwrap();
    registry.lock().unwrap().insert(1, raft.clone());

    let mut rafts = HashMap::new();
    rafts.insert(1, raft.clone());
    wait_for_leader(&rafts, Duration::from_secs(5)).await;

    let output = raft.client_write(Bytes::from_static(b"hello")).await.unwrap();
    assert!(output.index > 0);
    assert_eq!(&output.response[..], b"hello");
    assert_eq!(fsm.content(), b"hello");

    raft.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_replicate_a_command() {
    let mut membership = Membership::new();
    for id in 1..=3 {
        membership.add(id, &format!("addr-{id}"), Role::Voter).unwrap();
    }

    let registry: Arc<Mutex<HashMap<NodeId, Raft>>> = Arc::default();
    let mut rafts = HashMap::new();
    let mut fsms = HashMap::new();

    for id in 1..=3 {
        let mut storage = MemStore::new();
        raft::bootstrap(&mut storage, membership.clone()).await.unwrap();
        let network = Arc::new(Router { me: id, registry: registry.clone() });
        let fsm = MemStateMachine::new();
        let raft = Raft::new(id, &format!("addr-{id}"), test_config(), network, Box::new(storage), Box::new(fsm.clone()))
            .await
            .unwrap();
        registry.lock().unwrap().insert(id, raft.clone());
        rafts.insert(id, raft);
        fsms.insert(id, fsm);
    }

    let leader = wait_for_leader(&rafts, Duration::from_secs(10)).await;
    let output = rafts[&leader].client_write(Bytes::from_static(b"replicated")).await.unwrap();
    assert_eq!(&output.response[..], b"replicated");

    // Followers apply once the next heartbeat spreads the commit index.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if fsms.values().all(|f| f.content() == b"replicated") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "followers did not apply in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for raft in rafts.values() {
        raft.shutdown().await;
    }
}

#[tokio::test]
async fn bootstrap_twice_is_refused() {
    let mut storage = MemStore::new();
    raft::bootstrap(&mut storage, single_node_membership()).await.unwrap();
    let err = raft::bootstrap(&mut storage, single_node_membership()).await.unwrap_err();
    assert_eq!(err, pageraft::RaftError::CantBootstrap);
}
