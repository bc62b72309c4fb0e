//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// Typically, the network implementation as such will be a systems of sockets, http clients or
/// the like, but the Raft core is indifferent to it. A failure to reach a peer is a non-fatal
/// condition: the core logs it and retries on its next tick, so implementations should simply
/// surface the error instead of retrying internally. Messages handed to the network are owned by
/// it until the call resolves; delivery to a given peer may be lossy and reordered, which
/// receivers reconcile through the `prev_log_id` consistency check.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    ///
    /// The snapshot is transferred whole; the response is an AppendEntries result whose
    /// `last_log_index` acknowledges the snapshot boundary.
    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send a TimeoutNow RPC to the target Raft node to finish a leadership transfer.
    async fn send_timeout_now(&self, target: NodeId, rpc: TimeoutNowRequest) -> Result<()>;
}
