//! Membership change scenarios: add, promote with catch-up, remove,
//! rollback after leadership loss.

use pageraft::membership::Role;
use pageraft::storage::InitialState;
use pageraft::testing::Fixture;
use pageraft::RaftError;
use pageraft::ServerState;

fn empty_initial() -> InitialState {
    InitialState { term: 0, voted_for: None, snapshot: None, start_index: 1, entries: Vec::new() }
}

#[test]
fn add_server_joins_as_spare() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    fixture.add_harness(4, empty_initial());
    let request = fixture.submit_add_server(1, 4, "addr-4");
    fixture.step_until(3000, |f| f.request_result(request).is_some());
    assert!(fixture.request_result(request).unwrap().is_ok());

    for id in [1, 2, 3] {
        let server = fixture.membership(id).get(4).expect("server 4 known");
        assert_eq!(server.role, Role::Spare);
    }
    // Spares do not receive log entries.
    assert_eq!(fixture.last_log_index(4), 0);
}

#[test]
fn promotion_runs_catch_up_rounds() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    for i in 0..10 {
        let request = fixture.submit_write(1, format!("w{i}").as_bytes());
        fixture.step_until(2000, |f| f.request_result(request).is_some());
    }

    fixture.add_harness(4, empty_initial());
    let add = fixture.submit_add_server(1, 4, "addr-4");
    fixture.step_until(3000, |f| f.request_result(add).is_some());

    // The promotee starts from an empty log; the promotion only lands
    // once it caught up.
    let assign = fixture.submit_assign(1, 4, Role::Voter);
    fixture.step_until(10_000, |f| f.request_result(assign).is_some());
    assert!(fixture.request_result(assign).unwrap().is_ok());

    assert_eq!(fixture.membership(1).get(4).unwrap().role, Role::Voter);
    assert!(fixture.last_log_index(4) >= fixture.commit_index(1).saturating_sub(1));
    assert_eq!(fixture.membership(1).voter_count(), 4);
}

#[test]
fn promotion_of_unreachable_server_fails() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    let request = fixture.submit_write(1, b"baseline");
    fixture.step_until(2000, |f| f.request_result(request).is_some());

    fixture.add_harness(4, empty_initial());
    let add = fixture.submit_add_server(1, 4, "addr-4");
    fixture.step_until(3000, |f| f.request_result(add).is_some());

    fixture.kill(4);
    let assign = fixture.submit_assign(1, 4, Role::Voter);
    fixture.step_until(20_000, |f| f.request_result(assign).is_some());
    assert_eq!(fixture.request_result(assign).unwrap().as_ref().unwrap_err(), &RaftError::NoConnection);
    assert_eq!(fixture.membership(1).get(4).unwrap().role, Role::Spare);
}

#[test]
fn remove_server_shrinks_the_cluster() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    let request = fixture.submit_remove_server(1, 3);
    fixture.step_until(3000, |f| f.request_result(request).is_some());
    assert!(fixture.request_result(request).unwrap().is_ok());

    assert_eq!(fixture.membership(1).len(), 2);
    assert!(fixture.membership(1).get(3).is_none());
    assert_eq!(fixture.membership(1).quorum(), 2);
}

#[test]
fn only_one_change_in_flight() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    fixture.add_harness(4, empty_initial());
    fixture.add_harness(5, empty_initial());
    let first = fixture.submit_add_server(1, 4, "addr-4");
    let second = fixture.submit_add_server(1, 5, "addr-5");

    // The second is refused synchronously while the first is pending.
    assert_eq!(fixture.request_result(second).unwrap().as_ref().unwrap_err(), &RaftError::CantChange);
    fixture.step_until(3000, |f| f.request_result(first).is_some());
    assert!(fixture.request_result(first).unwrap().is_ok());
}

/// A configuration entry that never commits is rolled back when the new
/// leader's log overwrites it.
#[test]
fn uncommitted_change_rolls_back_on_leadership_loss() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    let request = fixture.submit_write(1, b"baseline");
    fixture.step_until(2000, |f| f.request_result(request).is_some());

    // The isolated leader appends a demotion that can never commit.
    fixture.isolate(1);
    let change = fixture.submit_assign(1, 3, Role::Standby);
    assert_eq!(fixture.membership(1).get(3).unwrap().role, Role::Standby);
    assert!(fixture.core(1).membership_uncommitted_index() > 0);

    // The others elect a new leader and commit fresh entries.
    fixture.step_until(5000, |f| f.leader().map(|l| l != 1).unwrap_or(false));
    let new_leader = fixture.leader().unwrap();
    let winner = fixture.submit_write(new_leader, b"winner");
    fixture.step_until(2000, |f| f.request_result(winner).is_some());

    // The change fails on the old leader no later than its step-down.
    fixture.step_until(3000, |f| f.request_result(change).is_some());
    assert!(fixture.request_result(change).unwrap().is_err());

    // On rejoin the uncommitted entry is truncated and the committed
    // configuration restored: server 3 is a voter again everywhere.
    fixture.restore_link(1);
    let last = fixture.last_log_index(new_leader);
    fixture.step_until(5000, |f| f.last_applied(1) >= last);

    for id in [1, 2, 3] {
        assert_eq!(fixture.membership(id).get(3).unwrap().role, Role::Voter, "server {id} disagrees");
        assert_eq!(fixture.core(id).membership_uncommitted_index(), 0);
    }
    assert_eq!(
        fixture.core(1).membership_committed_index(),
        fixture.core(new_leader).membership_committed_index()
    );
}

/// A leader that demotes itself steps down once the entry commits.
#[test]
fn self_demotion_steps_down_after_commit() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    let request = fixture.submit_assign(1, 1, Role::Standby);
    fixture.step_until(3000, |f| f.request_result(request).is_some());
    assert!(fixture.request_result(request).unwrap().is_ok());
    assert_eq!(fixture.state(1), ServerState::Follower);

    // The remaining voters pick a new leader.
    fixture.step_until(5000, |f| f.leader().map(|l| l != 1).unwrap_or(false));
}
