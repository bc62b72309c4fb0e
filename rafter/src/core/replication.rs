use tokio::sync::oneshot;

use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::quorum;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationMetrics;
use crate::replication::ReplicationStream;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Spawn a new replication stream returning its replication state handle.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&mut self, target: NodeId) -> ReplicationState<D> {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId { term: 0, index: 0 },
            recent_recv: false,
            remove_after_commit: None,
            replstream,
        }
    }

    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        let res = match event {
            ReplicaEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
                return;
            }
        };

        if let Err(err) = res {
            tracing::error!({error=%err}, "error while processing event from replication stream");
        }
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_matched(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        // Update target's match index & check if it is awaiting removal.
        let mut needs_removal = false;
        match self.nodes.get_mut(&target) {
            Some(state) => {
                if matched > state.matched {
                    state.matched = matched;
                }
                state.recent_recv = true;
                if let Some(threshold) = &state.remove_after_commit {
                    if &matched.index >= threshold {
                        needs_removal = true;
                    }
                }
            }
            _ => return Ok(()),
        }

        self.update_leader_metrics(target, matched);

        // A server removed from the config is detached once it has replicated the config entry
        // which removed it.
        if needs_removal {
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }

        // Drive whatever was waiting on this follower's progress.
        self.update_catch_up_progress(target, matched).await;
        self.check_transfer_progress(target, matched).await;

        self.try_advance_commit_index().await
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn update_leader_metrics(&mut self, target: NodeId, matched: LogId) {
        self.leader_metrics.replication.insert(target, ReplicationMetrics { matched });
    }

    /// Compute the commit index which the current voter match indexes support.
    ///
    /// This is the index of the (majority)th highest match among voters, the leader's own log
    /// counting as its last appended entry.
    fn calc_commit_index(&self) -> u64 {
        let voters = self.core.membership.voter_ids();
        if voters.is_empty() {
            return self.core.commit_index;
        }

        let mut indexes = Vec::with_capacity(voters.len());
        for id in voters.iter() {
            if id == &self.core.id {
                indexes.push(self.core.last_log_id.index);
            } else {
                indexes.push(self.nodes.get(id).map(|node| node.matched.index).unwrap_or(0));
            }
        }
        indexes.sort_unstable();
        indexes.reverse();
        indexes[quorum::majority_of(indexes.len()) - 1]
    }

    /// Advance the commit index if a majority of voters supports it, then respond to any client
    /// requests which the advance has committed.
    ///
    /// Per the term-safety rule of §5.4.2, only an entry of the current term may be committed by
    /// counting replicas; earlier entries commit transitively.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn try_advance_commit_index(&mut self) -> RaftResult<()> {
        let new_commit = self.calc_commit_index();
        if new_commit <= self.core.commit_index {
            return Ok(());
        }

        let term_ok = if new_commit == self.core.last_log_id.index {
            self.core.last_log_id.term == self.core.current_term
        } else {
            match self
                .core
                .storage
                .try_get_log_entry(new_commit)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?
            {
                Some(entry) => entry.log_id.term == self.core.current_term,
                // Below the snapshot boundary: the entry was committed and applied long ago.
                None => true,
            }
        };
        if !term_ok {
            return Ok(());
        }

        self.core.commit_index = new_commit;

        // Update all replication streams based on new commit index.
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: new_commit,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // Check if there are any pending requests which need to be processed.
        let filter = self
            .awaiting_committed
            .iter()
            .take_while(|elem| elem.entry.log_id.index <= new_commit)
            .count();
        let pending = self.awaiting_committed.drain(..filter).collect::<Vec<_>>();
        for request in pending {
            tracing::debug!("handling pending client request at log index {}", request.entry.log_id.index);
            self.client_request_post_commit(request).await;
        }

        self.leader_report_metrics();
        Ok(())
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, _target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
        Ok(())
    }

    /// Handle events from replication streams requesting the current snapshot.
    ///
    /// If no snapshot exists yet, a compaction is forced and the request channel is dropped;
    /// the stream will re-request once the compaction has run.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(&mut self, _target: NodeId, tx: oneshot::Sender<Snapshot>) -> RaftResult<()> {
        let current = self
            .core
            .storage
            .get_current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        match current {
            Some(snapshot) => {
                if self.core.snapshot_last_log_id != snapshot.meta.last_log_id {
                    self.core.snapshot_last_log_id = snapshot.meta.last_log_id;
                    self.core.report_metrics(Update::Ignore);
                }
                let _ = tx.send(snapshot);
            }
            None => {
                self.core.trigger_log_compaction_if_needed(true);
            }
        }
        Ok(())
    }
}
