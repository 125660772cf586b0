//! Runtime configuration of a raft server.

use clap::Parser;

use crate::error::ConfigError;
use crate::Millis;

/// The runtime configuration of one raft server.
///
/// The struct derives [`clap::Parser`] so that binaries embedding the
/// engine can expose every knob on their command line; library users
/// usually start from [`Config::default`] and override fields.
///
/// All durations are in milliseconds.
#[derive(Clone, Debug, Parser)]
#[clap(about, author, version)]
pub struct Config {
    /// Baseline election timeout. The effective timeout of a follower or
    /// candidate is re-randomized in `[election_timeout, 2 * election_timeout)`
    /// after every reset.
    #[clap(long, env = "PAGERAFT_ELECTION_TIMEOUT", default_value = "1000")]
    pub election_timeout: Millis,

    /// Interval at which an idle leader sends heartbeat AppendEntries.
    /// An entry-bearing AppendEntries sent within the interval makes the
    /// heartbeat unnecessary and it is skipped.
    #[clap(long, env = "PAGERAFT_HEARTBEAT_TIMEOUT", default_value = "100")]
    pub heartbeat_timeout: Millis,

    /// How long the leader waits for a reply to any snapshot-install RPC
    /// before re-sending the same message.
    #[clap(long, env = "PAGERAFT_INSTALL_SNAPSHOT_TIMEOUT", default_value = "10000")]
    pub install_snapshot_timeout: Millis,

    /// Number of applied entries after which a new snapshot is taken.
    #[clap(long, env = "PAGERAFT_SNAPSHOT_THRESHOLD", default_value = "1024")]
    pub snapshot_threshold: u64,

    /// Number of log entries to retain behind the snapshot anchor, so that
    /// slightly-lagging followers can be caught up without a snapshot.
    #[clap(long, env = "PAGERAFT_SNAPSHOT_TRAILING", default_value = "128")]
    pub snapshot_trailing: u64,

    /// Whether candidates run a non-persistent pre-vote round before
    /// incrementing their term.
    #[clap(long, env = "PAGERAFT_PRE_VOTE")]
    pub pre_vote: bool,

    /// Maximum number of log-replication rounds used to catch a promotee
    /// up before a promotion to voter is committed.
    #[clap(long, default_value = "10")]
    pub max_catch_up_rounds: u16,

    /// Deadline for a single catch-up round.
    #[clap(long, default_value = "5000")]
    pub max_catch_up_round_duration: Millis,

    /// Maximum number of entries shipped in one AppendEntries message.
    #[clap(long, default_value = "128")]
    pub max_append_entries: u64,

    /// Page size used by the incremental snapshot-install protocol.
    #[clap(long, default_value = "4096")]
    pub page_size: u32,

    /// Number of page checksums computed per background job on the
    /// follower, and requested per Signature message by the leader.
    #[clap(long, default_value = "64")]
    pub signature_batch_pages: u32,

    /// Maximum number of page moves packed into one Mv message.
    #[clap(long, default_value = "16")]
    pub move_batch_pages: u32,
}

impl Default for Config {
    fn default() -> Self {
        // Empty argv yields the clap defaults declared above.
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Build a `Config` from command-line style arguments, then validate.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::parse_from(args);
        config.validate()
    }

    /// Check cross-field requirements, returning `self` for chaining.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.election_timeout <= self.heartbeat_timeout {
            return Err(ConfigError::ElectionTimeoutNotLargerThanHeartbeat {
                election: self.election_timeout,
                heartbeat: self.heartbeat_timeout,
            });
        }

        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }

        if self.max_append_entries == 0 {
            return Err(ConfigError::ZeroAppendBatch);
        }

        Ok(self)
    }
}
