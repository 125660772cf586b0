//! Leadership transfer scenarios.

use pageraft::testing::Fixture;
use pageraft::RaftError;
use pageraft::ServerState;

#[test]
fn transfer_to_caught_up_voter_succeeds() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    let request = fixture.submit_write(1, b"payload");
    fixture.step_until(2000, |f| f.request_result(request).is_some());

    let transfer = fixture.submit_transfer(1, 2);
    fixture.step_until(3000, |f| f.leader() == Some(2));

    assert_eq!(fixture.state(2), ServerState::Leader);
    fixture.step_until(2000, |f| f.request_result(transfer).is_some());
    assert!(fixture.request_result(transfer).unwrap().is_ok());
    assert_eq!(fixture.state(1), ServerState::Follower);

    // The new leader accepts proposals right away.
    let request = fixture.submit_write(2, b"after-transfer");
    fixture.step_until(2000, |f| f.request_result(request).is_some());
    assert!(fixture.request_result(request).unwrap().is_ok());
}

#[test]
fn transfer_picks_most_caught_up_voter_when_unspecified() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    let request = fixture.submit_write(1, b"payload");
    fixture.step_until(2000, |f| f.request_result(request).is_some());

    let transfer = fixture.submit_transfer(1, 0);
    fixture.step_until(3000, |f| f.leader().map(|l| l != 1).unwrap_or(false));
    fixture.step_until(2000, |f| f.request_result(transfer).is_some());
    assert!(fixture.request_result(transfer).unwrap().is_ok());
}

#[test]
fn proposals_are_refused_while_transferring() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    let request = fixture.submit_write(1, b"payload");
    fixture.step_until(2000, |f| f.request_result(request).is_some());

    // Freeze the cluster so the transfer stays pending for a moment.
    fixture.disconnect(1, 2);
    fixture.disconnect(1, 3);
    let transfer = fixture.submit_transfer(1, 2);

    let refused = fixture.submit_write(1, b"nope");
    assert_eq!(fixture.request_result(refused).unwrap().as_ref().unwrap_err(), &RaftError::NotLeader);

    // Eventually the transfer expires.
    fixture.step_until(5000, |f| f.request_result(transfer).is_some());
    assert!(fixture.request_result(transfer).unwrap().is_err());
}

/// Killing the target before it receives TimeoutNow expires the
/// transfer; the leader resumes normal duty.
#[test]
fn transfer_to_dead_target_expires() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    let request = fixture.submit_write(1, b"payload");
    fixture.step_until(2000, |f| f.request_result(request).is_some());

    fixture.kill(2);
    let transfer = fixture.submit_transfer(1, 2);
    fixture.step_until(3000, |f| f.request_result(transfer).is_some());
    assert_eq!(fixture.request_result(transfer).unwrap().as_ref().unwrap_err(), &RaftError::NoConnection);

    // Leader 1 keeps its office and keeps serving.
    assert_eq!(fixture.leader(), Some(1));
    let request = fixture.submit_write(1, b"resumed");
    fixture.step_until(2000, |f| f.request_result(request).is_some());
    assert!(fixture.request_result(request).unwrap().is_ok());
}

#[test]
fn transfer_to_unknown_server_is_refused() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    let transfer = fixture.submit_transfer(1, 9);
    assert_eq!(fixture.request_result(transfer).unwrap().as_ref().unwrap_err(), &RaftError::BadId);
}
