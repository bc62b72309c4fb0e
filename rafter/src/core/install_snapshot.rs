use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to install a full snapshot on a follower (§7).
    ///
    /// The snapshot arrives in a single RPC. The response is an AppendEntries result whose
    /// `last_log_index` acknowledges the snapshot boundary, which is how the leader's
    /// replication stream learns the follower's new match point.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: req.meta.last_log_id.index.max(1),
                last_log_index: self.last_log_id.index,
            });
        }

        // Update election timeout.
        self.update_next_election_timeout(true);

        // Update current term if needed.
        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }

        // Update current leader if needed.
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }

        // If not follower, become follower.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower); // State update will emit metrics.
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // A snapshot which is no newer than what this node has already applied carries nothing
        // new: acknowledge it so the leader's stream can move on, but change nothing.
        if req.meta.last_log_id.index <= self.last_applied.index {
            tracing::debug!(snapshot=%req.meta.last_log_id, last_applied=%self.last_applied, "ignoring stale snapshot");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: 0,
                last_log_index: req.meta.last_log_id.index,
            });
        }

        // Abort a locally running compaction in favor of installation from the leader.
        if let Some(SnapshotState::Snapshotting { handle, .. }) = self.snapshot_state.take() {
            handle.abort();
        }

        // Persist the snapshot, truncate the log through its boundary, restore the state
        // machine and adopt the covered configuration.
        let boundary = req.meta.last_log_id;
        let meta = req.meta;
        self.storage
            .install_snapshot(&meta, req.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        if boundary > self.last_log_id {
            self.last_log_id = boundary;
        }
        self.last_applied = boundary;
        self.commit_index = boundary.index;
        self.snapshot_last_log_id = boundary;

        let membership = self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership)?;
        self.report_metrics(Update::Ignore);

        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: boundary.index,
        })
    }
}
