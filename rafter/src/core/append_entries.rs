use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=req.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: req.prev_log_id.index.max(1),
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

        // Transition to follower state if needed: an AppendEntries of the current term deposes
        // candidates and stale leaders alike.
        if !self.target_state.is_follower() && !self.target_state.is_non_voter() {
            self.set_target_state(State::Follower);
        }

        if report_metrics {
            self.report_metrics(Update::Ignore);
        }

        // The consistency check of §5.3: the entry preceding the new batch must match.
        if !self.matches_prev_log_id(&req).await? {
            tracing::debug!(prev_log_id=%req.prev_log_id, last_log_id=%self.last_log_id, "rejecting AppendEntries on log inconsistency");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                rejected: req.prev_log_id.index.max(1),
                last_log_index: self.last_log_id.index,
            });
        }

        self.append_log_entries(&req.entries).await?;

        // The final entry covered by this request: commitment may not run ahead of it even when
        // the leader's commit index does.
        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, self.last_log_id.index);
            self.replicate_to_state_machine_if_needed();
            self.report_metrics(Update::Ignore);
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: self.last_log_id.index,
        })
    }

    /// Check whether this node's log matches the leader's at `prev_log_id`.
    async fn matches_prev_log_id(&mut self, req: &AppendEntriesRequest<D>) -> RaftResult<bool> {
        let prev = req.prev_log_id;

        // An empty prefix always matches.
        if prev.index == 0 {
            return Ok(true);
        }
        // Entries at or below the snapshot boundary are committed; the log-matching property
        // guarantees the prefix is identical.
        if prev.index == self.snapshot_last_log_id.index {
            return Ok(prev.term == self.snapshot_last_log_id.term);
        }
        if prev.index < self.snapshot_last_log_id.index {
            return Ok(true);
        }
        if prev.index == self.last_log_id.index {
            return Ok(prev.term == self.last_log_id.term);
        }
        if prev.index > self.last_log_id.index {
            return Ok(false);
        }

        let entry = self
            .storage
            .try_get_log_entry(prev.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(matches!(entry, Some(entry) if entry.log_id.term == prev.term))
    }

    /// Append the given entries to the log, resolving conflicts with the local suffix.
    ///
    /// Entries already present with a matching term are skipped. At the first conflicting index,
    /// the local suffix is truncated (it is uncommitted by construction) and replaced with the
    /// leader's entries. Configuration entries take effect as soon as they are appended, and a
    /// truncation can likewise retire the entry which defined the active configuration, so the
    /// membership is re-resolved from storage whenever either happens.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    pub(super) async fn append_log_entries(&mut self, entries: &[Entry<D>]) -> RaftResult<()> {
        let mut did_truncate = false;
        let mut to_append: Vec<&Entry<D>> = Vec::with_capacity(entries.len());
        for entry in entries {
            let index = entry.log_id.index;

            // Entries covered by the snapshot are committed and applied; nothing to do.
            if index <= self.snapshot_last_log_id.index {
                continue;
            }

            if !did_truncate && index <= self.last_log_id.index {
                let existing = self
                    .storage
                    .try_get_log_entry(index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                if let Some(existing) = existing {
                    if existing.log_id == entry.log_id {
                        continue;
                    }
                }

                tracing::debug!(conflict_index = index, "truncating conflicting log suffix");
                self.storage
                    .delete_logs_from(index..)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                did_truncate = true;
            }

            to_append.push(entry);
        }

        if to_append.is_empty() && !did_truncate {
            return Ok(());
        }

        if !to_append.is_empty() {
            self.storage.append_to_log(&to_append).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = to_append.last().map(|ent| ent.log_id).unwrap_or(self.last_log_id);
        }

        let saw_config = did_truncate
            || to_append.iter().any(|ent| matches!(ent.payload, EntryPayload::ConfigChange(_)));
        if saw_config {
            let membership =
                self.storage.get_membership_config().await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.update_membership(membership)?;
        }

        self.report_metrics(Update::Ignore);
        Ok(())
    }

    /// Replicate any outstanding committed entries to the state machine.
    ///
    /// The work runs on a spawned task so the AppendEntries flow is not blocked by application
    /// of entries. At most one task runs at a time; entries are applied in strictly increasing
    /// index order, each index at most once. Completion is observed in the role loops, which
    /// re-invoke this method for anything which committed in the meantime.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn replicate_to_state_machine_if_needed(&mut self) {
        if self.commit_index <= self.last_applied.index {
            return;
        }
        if !self.replicate_to_sm_handle.is_empty() {
            return;
        }

        let start = self.last_applied.index + 1;
        let stop = self.commit_index + 1;
        let storage = self.storage.clone();
        let handle = tokio::spawn(async move {
            let entries = storage.get_log_entries(start..stop).await?;
            let last_applied = entries.last().map(|entry| entry.log_id);
            let data_entries: Vec<_> = entries.iter().collect();
            if !data_entries.is_empty() {
                storage.apply_to_state_machine(&data_entries).await?;
            }
            Ok(last_applied)
        });
        self.replicate_to_sm_handle.push(handle);
    }
}
