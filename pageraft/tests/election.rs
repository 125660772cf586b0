//! Election scenarios over the deterministic fixture.

use pageraft::config::Config;
use pageraft::testing::Fixture;
use pageraft::ServerState;

#[test]
fn two_voters_elect_a_single_leader() {
    let mut fixture = Fixture::new(2);

    // Both start as followers with empty volatile state.
    assert_eq!(fixture.state(1), ServerState::Follower);
    assert_eq!(fixture.state(2), ServerState::Follower);

    fixture.step_until(10_000, |f| f.has_leader());

    let leader = fixture.leader().unwrap();
    let follower = if leader == 1 { 2 } else { 1 };

    // Let the first heartbeats settle the loser back to follower.
    fixture.step(3 * 100);
    assert_eq!(fixture.state(leader), ServerState::Leader);
    assert_eq!(fixture.state(follower), ServerState::Follower);
    assert_eq!(fixture.current_term(leader), fixture.current_term(follower));
}

#[test]
fn elect_converges_on_the_requested_server() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    assert_eq!(fixture.leader(), Some(1));
    for id in [2, 3] {
        assert_eq!(fixture.state(id), ServerState::Follower);
    }
}

#[test]
fn leader_failure_triggers_reelection() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    // Commit one command first.
    let request = fixture.submit_write(1, b"payload");
    fixture.step_until(2000, |f| f.request_result(request).is_some());
    assert!(fixture.request_result(request).unwrap().is_ok());
    let committed = fixture.commit_index(1);

    fixture.kill(1);
    fixture.step_until(2 * 2000, |f| f.leader().is_some());
    let new_leader = fixture.leader().unwrap();
    assert_ne!(new_leader, 1);
    assert!(fixture.current_term(new_leader) > 1);

    // The survivors still accept and apply new commands.
    let request = fixture.submit_write(new_leader, b"more");
    fixture.step_until(2000, |f| f.request_result(request).is_some());
    let output_index = fixture.request_result(request).unwrap().as_ref().unwrap().index;
    assert!(output_index > committed);

    let survivor = if new_leader == 2 { 3 } else { 2 };
    fixture.step_until(2000, |f| f.last_applied(survivor) >= output_index);
}

#[test]
fn pre_vote_cluster_still_elects() {
    let mut config = Config::default();
    config.pre_vote = true;
    let mut fixture = Fixture::with_config(3, config);

    fixture.step_until(10_000, |f| f.has_leader());
    let leader = fixture.leader().unwrap();
    fixture.step(300);
    assert_eq!(fixture.state(leader), ServerState::Leader);
}

#[test]
fn pre_vote_candidate_does_not_bump_terms() {
    let mut config = Config::default();
    config.pre_vote = true;
    let mut fixture = Fixture::with_config(3, config);
    fixture.elect(1);
    let term = fixture.current_term(1);

    // An isolated server keeps campaigning, but only in pre-vote: its
    // term must not run away, and on reconnect it cannot depose the
    // leader.
    fixture.isolate(3);
    fixture.step(10_000);
    assert_eq!(fixture.current_term(3), term);

    fixture.restore_link(3);
    fixture.step(2000);
    assert_eq!(fixture.leader(), Some(1));
    assert_eq!(fixture.current_term(1), term);
}

#[test]
fn partitioned_leader_steps_down_without_contacts() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);
    assert!(fixture.voter_contacts(1) >= 2);

    fixture.isolate(1);
    fixture.step_until(3000, |f| f.state(1) == ServerState::Follower);

    // The majority side elects a replacement.
    fixture.step_until(4000, |f| f.leader().map(|l| l != 1).unwrap_or(false));
}

#[test]
fn commit_index_is_monotonic() {
    let mut fixture = Fixture::new(3);
    fixture.elect(1);

    let mut last = std::collections::HashMap::new();
    for round in 0..5 {
        let request = fixture.submit_write(1, format!("cmd-{round}").as_bytes());
        fixture.step_until(2000, |f| f.request_result(request).is_some());
        for id in fixture.ids() {
            let commit = fixture.commit_index(id);
            let prev = last.insert(id, commit).unwrap_or(0);
            assert!(commit >= prev, "commit index went backwards on server {id}");
        }
    }
}
