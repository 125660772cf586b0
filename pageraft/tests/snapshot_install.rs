//! End-to-end incremental snapshot installation over the fixture.

use pageraft::config::Config;
use pageraft::testing::Fixture;

/// Small pages and a low threshold so a handful of writes crosses the
/// snapshot boundary.
fn snapshot_config() -> Config {
    let mut config = Config::default();
    config.snapshot_threshold = 8;
    config.snapshot_trailing = 0;
    config.page_size = 16;
    config.signature_batch_pages = 4;
    config.move_batch_pages = 4;
    config
}

fn commit_writes(fixture: &mut Fixture, leader: u64, n: usize, tag: &str) {
    for i in 0..n {
        let request = fixture.submit_write(leader, format!("{tag}-{i:04}-xxxxxxxx").as_bytes());
        fixture.step_until(2000, |f| f.request_result(request).is_some());
        assert!(fixture.request_result(request).unwrap().is_ok());
    }
}

/// Scenario: a follower disconnects, the leader compacts its log, and
/// on reconnect the follower is caught up through the page-diff
/// protocol instead of entry replication.
#[test]
fn lagging_follower_is_installed_from_snapshot() {
    let mut fixture = Fixture::with_config(3, snapshot_config());
    fixture.elect(1);
    commit_writes(&mut fixture, 1, 4, "base");

    fixture.isolate(3);
    let stale_index = fixture.last_log_index(3);
    commit_writes(&mut fixture, 1, 12, "ahead");

    // The leader crossed the threshold and dropped entries behind the
    // anchor; the follower is now unreachable through AppendEntries.
    fixture.step_until(3000, |f| f.core(1).log().snapshot_last_index() > stale_index);
    assert!(fixture.core(1).log().first_index() > stale_index + 1 || fixture.core(1).log().num_entries() == 0);

    fixture.restore_link(3);
    let anchor = fixture.core(1).log().snapshot_last_index();
    fixture.step_until(60_000, |f| f.last_applied(3) >= anchor);

    // After the installation, replication resumes with plain
    // AppendEntries until the follower is fully caught up.
    let last = fixture.last_log_index(1);
    fixture.step_until(10_000, |f| f.last_applied(3) >= last);
    assert_eq!(fixture.db(3).content(), fixture.db(1).content());
}

/// The diff must not ship pages the follower already has: the common
/// prefix written before the partition stays local.
#[test]
fn install_converges_for_empty_follower() {
    let mut fixture = Fixture::with_config(3, snapshot_config());
    fixture.elect(1);

    // Server 3 misses everything from the start.
    fixture.isolate(3);
    commit_writes(&mut fixture, 1, 12, "only");
    fixture.step_until(3000, |f| f.core(1).log().snapshot_last_index() > 0);

    fixture.restore_link(3);
    let last = fixture.last_log_index(1);
    fixture.step_until(60_000, |f| f.last_applied(3) >= last);
    assert_eq!(fixture.db(3).content(), fixture.db(1).content());
}

/// A follower crash in mid-session: after restart its session state is
/// gone, the leader gets an `unexpected` reply, resets, and the next
/// attempt completes.
#[test]
fn follower_crash_mid_install_recovers() {
    let mut fixture = Fixture::with_config(3, snapshot_config());
    fixture.elect(1);
    commit_writes(&mut fixture, 1, 4, "base");

    fixture.isolate(3);
    commit_writes(&mut fixture, 1, 12, "ahead");
    fixture.step_until(3000, |f| f.core(1).log().snapshot_last_index() > 0);

    // Let the installation start, then crash the follower.
    fixture.restore_link(3);
    fixture.step(250);
    fixture.kill(3);
    fixture.step(100);
    fixture.restart(3);

    let last = fixture.last_log_index(1);
    fixture.step_until(120_000, |f| f.last_applied(3) >= last);
    assert_eq!(fixture.db(3).content(), fixture.db(1).content());
}

/// Further writes while the installation is running are replicated once
/// the follower re-enters normal replication.
#[test]
fn writes_during_install_reach_the_follower() {
    let mut fixture = Fixture::with_config(3, snapshot_config());
    fixture.elect(1);
    commit_writes(&mut fixture, 1, 4, "base");

    fixture.isolate(3);
    commit_writes(&mut fixture, 1, 12, "ahead");
    fixture.step_until(3000, |f| f.core(1).log().snapshot_last_index() > 0);

    fixture.restore_link(3);
    fixture.step(100);
    commit_writes(&mut fixture, 1, 3, "during");

    let last = fixture.last_log_index(1);
    fixture.step_until(120_000, |f| f.last_applied(3) >= last);
    assert_eq!(fixture.db(3).content(), fixture.db(1).content());
}
