//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use cases are to expose
//! these metrics to a metrics collection system. Applications may also use this data to trigger
//! events within higher levels of the parent application.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()` method, which will
//! return a stream of metrics.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::State;
use crate::membership::Configuration;
use crate::raft_types::LogId;
use crate::replication::ReplicationMetrics;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: Configuration,
    /// The id of the last log included in the most recent snapshot.
    pub snapshot: LogId,
    /// The metrics about the leader. It is Some() only when this node is leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

/// The metrics about the leader. It is Some() only when this node is leader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of all known replication targets of the leader.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: Configuration::default(),
            snapshot: LogId::default(),
            leader_metrics: None,
        }
    }
}

// Error variants related to metrics.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait for a metrics condition to be satisfied.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            tracing::debug!("wait metrics: {:?}", latest);

            if func(&latest) {
                tracing::debug!("done wait for metrics: {:?}", latest);
                return Ok(latest);
            }

            let delay = sleep_until(Instant::now() + self.timeout);

            tokio::select! {
                _ = delay => {
                    tracing::debug!("timeout waiting for metrics: {}", msg.to_string());
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    changed.map_err(|_| WaitError::ShuttingDown)?;
                }
            };
        }
    }

    /// Wait for `current_leader` to become `Some(leader_id)` until timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }

    /// Wait until applied at least `want_log`(inclusive) logs or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.last_log_index >= want_log && x.last_applied >= want_log,
            &format!("{} .last_log_index and .last_applied -> {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for `state` to become `want_state` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.state == want_state,
            &format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for the membership config to contain exactly the given server ids, or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn members(&self, want: Vec<NodeId>, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| {
                let mut ids: Vec<NodeId> = x.membership_config.servers.iter().map(|s| s.id).collect();
                ids.sort_unstable();
                ids == want
            },
            &format!("{} .membership_config.servers -> {:?}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for `snapshot` to become `want_snapshot` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn snapshot(&self, want_snapshot: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |x| x.snapshot == want_snapshot,
            &format!("{} .snapshot -> {:?}", msg.to_string(), want_snapshot),
        )
        .await
    }
}
