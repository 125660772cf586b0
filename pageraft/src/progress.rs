//! Per-follower replication progress, maintained by the leader.

use crate::LogIndex;
use crate::Millis;

/// Replication mode of one peer.
///
/// A peer starts in `Probe`: at most one AppendEntries in flight, re-sent
/// at most once per heartbeat interval, until the peer confirms a matching
/// log prefix. It then moves to `Pipeline`, where entries are streamed
/// optimistically. `Snapshot` means the peer is behind the snapshot anchor
/// and is being caught up by the snapshot-install protocol; regular
/// replication is paused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressMode {
    #[default]
    Probe,
    Pipeline,
    Snapshot,
}

/// What the leader knows about one peer.
#[derive(Clone, Debug)]
pub struct Progress {
    /// Index of the next entry to send.
    pub next_index: LogIndex,

    /// Highest index known to be replicated on the peer.
    pub match_index: LogIndex,

    pub mode: ProgressMode,

    /// Snapshot anchor being installed while `mode == Snapshot`.
    pub snapshot_index: LogIndex,

    /// Time of the last AppendEntries (or heartbeat) sent to the peer.
    pub last_send: Millis,

    /// Time of the last acknowledgment received from the peer.
    pub last_recv: Millis,

    /// Feature flags announced by the peer in its AppendEntries results.
    pub features: u64,
}

impl Progress {
    /// A fresh record for the start of a leadership term.
    pub fn new(last_index: LogIndex, now: Millis) -> Self {
        Progress {
            next_index: last_index + 1,
            match_index: 0,
            mode: ProgressMode::Probe,
            snapshot_index: 0,
            last_send: 0,
            last_recv: now,
            features: 0,
        }
    }

    /// Whether an AppendEntries may be sent right now.
    ///
    /// In probe mode sends are paced by the heartbeat interval; in
    /// pipeline mode they are not. No regular replication happens while a
    /// snapshot is being installed.
    pub fn may_send(&self, now: Millis, heartbeat_timeout: Millis) -> bool {
        match self.mode {
            ProgressMode::Probe => now >= self.last_send + heartbeat_timeout || self.last_send == 0,
            ProgressMode::Pipeline => true,
            ProgressMode::Snapshot => false,
        }
    }

    /// Record a successful ack up to `index`.
    pub fn ack(&mut self, index: LogIndex, now: Millis) {
        self.last_recv = now;
        if index > self.match_index {
            self.match_index = index;
        }
        if self.next_index <= self.match_index {
            self.next_index = self.match_index + 1;
        }
        if self.mode == ProgressMode::Probe {
            self.mode = ProgressMode::Pipeline;
        }
        debug_assert!(self.match_index <= self.next_index - 1);
    }

    /// Optimistically advance `next_index` after sending entries in
    /// pipeline mode.
    pub fn optimistic_advance(&mut self, last_sent: LogIndex) {
        debug_assert_eq!(self.mode, ProgressMode::Pipeline);
        if last_sent >= self.next_index {
            self.next_index = last_sent + 1;
        }
    }

    /// Rewind after a rejection carrying the follower's
    /// `last_log_index + 1` hint, and drop back to probe mode.
    pub fn rewind(&mut self, hint: LogIndex, now: Millis) {
        self.last_recv = now;
        let next = hint.min(self.next_index.saturating_sub(1)).max(1);
        self.next_index = next.max(self.match_index + 1);
        self.mode = ProgressMode::Probe;
    }

    /// Drop back to probe after a send failure or timeout, resetting the
    /// optimistic `next_index` to the last acknowledged point.
    pub fn to_probe(&mut self) {
        self.mode = ProgressMode::Probe;
        self.next_index = self.match_index + 1;
        self.snapshot_index = 0;
    }

    /// Enter snapshot mode for an installation anchored at `index`.
    pub fn to_snapshot(&mut self, index: LogIndex) {
        self.mode = ProgressMode::Snapshot;
        self.snapshot_index = index;
    }

    /// Leave snapshot mode after the follower caught up to the anchor.
    pub fn snapshot_done(&mut self) {
        debug_assert_eq!(self.mode, ProgressMode::Snapshot);
        self.match_index = self.snapshot_index;
        self.next_index = self.snapshot_index + 1;
        self.snapshot_index = 0;
        self.mode = ProgressMode::Probe;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn starts_probing_at_log_end() {
        let p = Progress::new(10, 0);
        assert_eq!(p.mode, ProgressMode::Probe);
        assert_eq!(p.next_index, 11);
        assert_eq!(p.match_index, 0);
    }

    #[test]
    fn probe_is_paced_by_heartbeat() {
        let mut p = Progress::new(10, 0);
        assert!(p.may_send(0, 100), "first probe goes out immediately");
        p.last_send = 50;
        assert!(!p.may_send(100, 100));
        assert!(p.may_send(150, 100));
    }

    #[test]
    fn first_ack_switches_to_pipeline() {
        let mut p = Progress::new(10, 0);
        p.ack(10, 5);
        assert_eq!(p.mode, ProgressMode::Pipeline);
        assert_eq!(p.match_index, 10);
        assert_eq!(p.next_index, 11);
        assert!(p.may_send(5, 100), "pipeline mode is not paced");
    }

    #[test]
    fn optimistic_advance_and_rewind() {
        let mut p = Progress::new(10, 0);
        p.ack(10, 5);
        p.optimistic_advance(15);
        assert_eq!(p.next_index, 16);

        // Follower is shorter than we thought.
        p.rewind(12, 6);
        assert_eq!(p.mode, ProgressMode::Probe);
        assert_eq!(p.next_index, 12);
    }

    #[test]
    fn rewind_never_goes_below_match() {
        let mut p = Progress::new(10, 0);
        p.ack(8, 5);
        p.rewind(3, 6);
        assert_eq!(p.next_index, 9);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut p = Progress::new(100, 0);
        p.to_snapshot(90);
        assert!(!p.may_send(1000, 100));
        p.snapshot_done();
        assert_eq!(p.mode, ProgressMode::Probe);
        assert_eq!(p.match_index, 90);
        assert_eq!(p.next_index, 91);
    }
}
