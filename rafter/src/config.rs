//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Log compaction and snapshot policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft clusters which will
/// be running with nodes in multiple datacenter availability zones with low latency between
/// zones. These values should typically be made configurable from the perspective of the
/// application which is being built on top of Raft.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    ///
    /// Defaults to 50 milliseconds.
    ///
    /// **NOTE WELL:** it is very important that this value be greater than the amount of time
    /// it will take on average for heartbeat frames to be sent between nodes. No data processing
    /// is performed for heartbeats, so the main item of concern here is network latency. This
    /// value is also used as the default timeout for sending heartbeats.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The distance behind in log replication before a replication stream is considered lagging.
    pub replication_lag_threshold: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The number of log entries to keep in the log behind a snapshot once one is taken.
    ///
    /// Keeping a short tail of already-snapshotted entries lets followers which are only a
    /// little behind catch up from the log instead of receiving a full snapshot.
    pub snapshot_trailing: u64,
    /// The timeout in milliseconds for sending an InstallSnapshot RPC.
    pub install_snapshot_timeout: u64,
    /// The maximum number of catch-up rounds granted to a server being promoted to voter.
    ///
    /// A round completes when the promotee has replicated every entry the log held when the
    /// round started. The promotion goes through as soon as a round completes within one
    /// election timeout; after this many rounds without such a completion, the promotion fails.
    pub max_catch_up_rounds: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    ///
    /// The directives of the `Config` instance returned from this method will be derived
    /// from this type's defaults, and may be customized as needed.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_trailing: None,
            install_snapshot_timeout: None,
            max_catch_up_rounds: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub max_payload_entries: Option<u64>,
    pub replication_lag_threshold: Option<u64>,
    pub snapshot_policy: Option<SnapshotPolicy>,
    pub snapshot_trailing: Option<u64>,
    pub install_snapshot_timeout: Option<u64>,
    pub max_catch_up_rounds: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `replication_lag_threshold`.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_trailing`.
    pub fn snapshot_trailing(mut self, val: u64) -> Self {
        self.snapshot_trailing = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the desired value for `max_catch_up_rounds`.
    pub fn max_catch_up_rounds(mut self, val: u64) -> Self {
        self.max_catch_up_rounds = Some(val);
        self
    }

    /// Validate the state of this builder, returning a usable `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        // Roll a random election timeout window, if none was specified.
        let election_timeout_min = self.election_timeout_min.unwrap_or(150);
        let election_timeout_max = self.election_timeout_max.unwrap_or(election_timeout_min * 2);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(50);
        if election_timeout_min <= heartbeat_interval * 2 {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(300);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let replication_lag_threshold = self.replication_lag_threshold.unwrap_or(1000);
        let snapshot_policy = self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(5000));
        let snapshot_trailing = self.snapshot_trailing.unwrap_or(100);
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(200);
        let max_catch_up_rounds = self.max_catch_up_rounds.unwrap_or(10);
        if max_catch_up_rounds == 0 {
            return Err(ConfigError::MaxCatchUpRoundsTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            snapshot_policy,
            snapshot_trailing,
            install_snapshot_timeout,
            max_catch_up_rounds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!(cfg.cluster_name, "cluster0");
        assert_eq!(cfg.election_timeout_min, 150);
        assert_eq!(cfg.election_timeout_max, 300);
        assert_eq!(cfg.heartbeat_interval, 50);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(5000));
    }

    #[test]
    fn test_config_rejects_inverted_election_window() {
        let res = Config::build("cluster0".into()).election_timeout_min(300).election_timeout_max(299).validate();
        assert!(res.is_err());
    }

    #[test]
    fn test_rand_election_timeout_stays_in_window() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min && t < cfg.election_timeout_max);
        }
    }
}
