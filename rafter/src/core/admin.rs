use tokio::time::Duration;
use tokio::time::Instant;

use crate::core::ConfChangePhase;
use crate::core::ConfChangeState;
use crate::core::LeaderState;
use crate::core::State;
use crate::core::TransferState;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeConfigError;
use crate::membership::Configuration;
use crate::membership::Role;
use crate::membership::Server;
use crate::raft::ClientWriteRequest;
use crate::raft::ResponseTx;
use crate::raft::TimeoutNowRequest;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Add a new server to the cluster as a spare.
    ///
    /// Spares receive neither votes nor log entries, so the config entry can be appended right
    /// away; there is nothing to catch up.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn add_server(&mut self, id: NodeId, address: String, tx: ResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(None).into()));
            return;
        }
        if self.conf_change.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress.into()));
            return;
        }
        if id == 0 {
            let _ = tx.send(Err(ChangeConfigError::InvalidServerId.into()));
            return;
        }
        if self.core.membership.contains(&id) {
            let _ = tx.send(Err(ChangeConfigError::ServerExists.into()));
            return;
        }

        let new_config = self.core.membership.with_server_added(Server {
            id,
            address,
            role: Role::Spare,
        });
        self.append_config_change(id, new_config, Some(tx)).await;
    }

    /// Assign a new role to a cluster member.
    ///
    /// A promotion to voter first drives catch-up rounds so that granting the vote does not
    /// stall the cluster behind a log-less member; every other role change is appended
    /// immediately.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn assign_role(&mut self, id: NodeId, role: Role, tx: ResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(None).into()));
            return;
        }
        if self.conf_change.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress.into()));
            return;
        }
        let server = match self.core.membership.get(&id) {
            Some(server) => server.clone(),
            None => {
                let _ = tx.send(Err(ChangeConfigError::UnknownServer.into()));
                return;
            }
        };
        if server.role == role {
            let _ = tx.send(Err(ChangeConfigError::InvalidRole { id, role }.into()));
            return;
        }

        let new_config = self.core.membership.with_role(id, role);

        // Promotions of remote servers run catch-up rounds first. A promotee which is already at
        // the leader's end of log skips them entirely.
        if role == Role::Voter && id != self.core.id {
            if !self.nodes.contains_key(&id) {
                // Spares have no replication stream; catch-up needs one.
                let state = self.spawn_replication_stream(id);
                self.nodes.insert(id, state);
            }

            let matched = self.nodes.get(&id).map(|node| node.matched.index).unwrap_or(0);
            if matched < self.core.last_log_id.index {
                tracing::info!(target=id, "starting catch-up rounds for promotion to voter");
                self.conf_change = Some(ConfChangeState {
                    target: id,
                    new_config,
                    phase: ConfChangePhase::CatchingUp {
                        round_number: 1,
                        round_index: self.core.last_log_id.index,
                        round_start: Instant::now(),
                    },
                    tx: Some(tx),
                });
                return;
            }
        }

        self.append_config_change(id, new_config, Some(tx)).await;
    }

    /// Remove a server from the cluster.
    ///
    /// The leader may remove itself; it keeps replicating until the config entry commits and
    /// steps down at that point.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn remove_server(&mut self, id: NodeId, tx: ResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(None).into()));
            return;
        }
        if self.conf_change.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress.into()));
            return;
        }
        if !self.core.membership.contains(&id) {
            let _ = tx.send(Err(ChangeConfigError::UnknownServer.into()));
            return;
        }

        let new_config = self.core.membership.with_server_removed(id);
        if new_config.voter_ids().is_empty() {
            // Removing the last voter would leave the cluster without a quorum, ever.
            let _ = tx.send(Err(ChangeConfigError::InvalidServerId.into()));
            return;
        }

        self.append_config_change(id, new_config, Some(tx)).await;
    }

    /// Append a configuration entry to the log and begin replicating it.
    ///
    /// The configuration takes effect in memory as soon as the entry is appended. If the append
    /// fails, the previous membership and change interlock are restored before the error is
    /// reported, leaving no half-applied change behind.
    #[tracing::instrument(level = "trace", skip(self, new_config, tx))]
    pub(super) async fn append_config_change(
        &mut self,
        target: NodeId,
        new_config: Configuration,
        tx: Option<ResponseTx>,
    ) {
        let prev_membership = self.core.membership.clone();
        self.core.membership = new_config.clone();

        let payload = ClientWriteRequest::<D>::new_config(new_config.clone());
        let entry = match self.append_payload_to_log(payload.entry).await {
            Ok(entry) => entry,
            Err(err) => {
                self.core.membership = prev_membership;
                self.conf_change = None;
                if let Some(tx) = tx {
                    let _ = tx.send(Err(ChangeConfigError::RaftError(err).into()));
                }
                return;
            }
        };

        // Spawn replication streams for any member which newly receives the log. Streams of
        // servers which stopped being members are retired once the entry commits.
        self.update_replication_streams();

        // A leader which is no longer a voter under the new config steps down at commit time.
        self.is_stepping_down = !self.core.membership.is_voter(&self.core.id);

        self.conf_change = Some(ConfChangeState {
            target,
            new_config,
            phase: ConfChangePhase::Committing {
                index: entry.log_id.index,
            },
            tx,
        });

        let cr_entry = crate::core::client::ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;
    }

    /// Spawn replication streams for replicating members which do not have one yet.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn update_replication_streams(&mut self) {
        let targets = self.core.membership.replication_targets();
        for target in targets {
            if target == self.core.id || self.nodes.contains_key(&target) {
                continue;
            }
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }
    }

    /// Drive the catch-up rounds of a pending promotion with a follower's new match index.
    ///
    /// A round completes when the promotee has replicated everything the log held when the
    /// round started. A round which completes within one election timeout proves the promotee
    /// can keep up, and the promotion is appended; otherwise a new round begins, bounded by
    /// `max_catch_up_rounds`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn update_catch_up_progress(&mut self, target: NodeId, matched: LogId) {
        let (round_number, round_index, round_start) = match &self.conf_change {
            Some(change) if change.target == target => match &change.phase {
                ConfChangePhase::CatchingUp {
                    round_number,
                    round_index,
                    round_start,
                } => (*round_number, *round_index, *round_start),
                _ => return,
            },
            _ => return,
        };

        if matched.index < round_index {
            return;
        }

        // The round is complete.
        let election_timeout = Duration::from_millis(self.core.config.election_timeout_min);
        if round_start.elapsed() <= election_timeout {
            // The promotee kept up: the promotion goes through.
            tracing::info!(target, round_number, "catch-up complete, appending promotion");
            let change = match self.conf_change.take() {
                Some(change) => change,
                None => return,
            };
            self.append_config_change(change.target, change.new_config, change.tx).await;
            return;
        }

        if round_number >= self.core.config.max_catch_up_rounds {
            tracing::warn!(target, round_number, "promotion abandoned, promotee cannot catch up");
            self.fail_catch_up();
            return;
        }

        // Too slow: grant another round over whatever has been appended in the meantime.
        let next_round_index = self.core.last_log_id.index;
        if let Some(change) = self.conf_change.as_mut() {
            change.phase = ConfChangePhase::CatchingUp {
                round_number: round_number + 1,
                round_index: next_round_index,
                round_start: Instant::now(),
            };
        }
    }

    /// Expire a catch-up which has made no progress at all, so a dead promotee does not hold
    /// the config-change interlock forever.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn check_catch_up_round_expiry(&mut self) -> crate::error::RaftResult<()> {
        let expired = match &self.conf_change {
            Some(change) => match &change.phase {
                ConfChangePhase::CatchingUp { round_start, .. } => {
                    let budget = self.core.config.election_timeout_min * self.core.config.max_catch_up_rounds;
                    round_start.elapsed() > Duration::from_millis(budget)
                }
                _ => false,
            },
            None => false,
        };
        if expired {
            tracing::warn!("promotion abandoned, promotee made no progress within its round budget");
            self.fail_catch_up();
        }
        Ok(())
    }

    /// Fail the in-flight promotion and retire its replication stream if the target is not a
    /// replicating member of the active configuration.
    fn fail_catch_up(&mut self) {
        let change = match self.conf_change.take() {
            Some(change) => change,
            None => return,
        };
        if let Some(tx) = change.tx {
            let _ = tx.send(Err(ChangeConfigError::CatchUpTimeout.into()));
        }
        if !self.core.membership.replication_targets().contains(&change.target) {
            if let Some(node) = self.nodes.remove(&change.target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&change.target);
            }
        }
    }

    /// Handle the commitment of a configuration entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn handle_config_entry_committed(&mut self, index: u64) {
        // Respond to the client which proposed this change, if it is the one in flight.
        let is_current_change = matches!(
            &self.conf_change,
            Some(change) if matches!(&change.phase, ConfChangePhase::Committing { index: at } if *at == index)
        );
        if is_current_change {
            if let Some(change) = self.conf_change.take() {
                if let Some(tx) = change.tx {
                    let _ = tx.send(Ok(index));
                }
            }
        }

        // Step down if this node is no longer a voter under the committed configuration.
        if self.is_stepping_down {
            tracing::debug!("raft node is stepping down");
            self.core.set_target_state(State::NonVoter);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            return;
        }

        // Remove any replication streams which have replicated this config & which are no longer
        // replicating members. All other replication streams of servers which are no longer
        // members, but which have not yet replicated this config, will be marked for removal.
        let targets = self.core.membership.replication_targets();
        let nodes_to_remove: Vec<_> = self
            .nodes
            .iter_mut()
            .filter(|(id, _)| !targets.contains(id))
            .filter_map(|(id, replstate)| {
                if replstate.matched.index >= index {
                    Some(*id)
                } else {
                    replstate.remove_after_commit = Some(index);
                    None
                }
            })
            .collect();

        for target in nodes_to_remove {
            tracing::debug!(target, "removing target node from replication pool");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }
        self.leader_report_metrics();
    }

    /// Begin transferring leadership to another voter.
    ///
    /// The TimeoutNow RPC fires as soon as the target's log matches the leader's, which may be
    /// immediately. While the transfer is pending, client writes are refused as not-leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn transfer_leadership(&mut self, target: Option<NodeId>, tx: ResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress.into()));
            return;
        }

        let target = match target {
            Some(id) => {
                if !self.core.membership.contains(&id) {
                    let _ = tx.send(Err(ChangeConfigError::UnknownServer.into()));
                    return;
                }
                if id == self.core.id || !self.core.membership.is_voter(&id) {
                    let _ = tx.send(Err(ChangeConfigError::InvalidServerId.into()));
                    return;
                }
                id
            }
            None => {
                // Pick the most caught-up voter.
                let candidate = self
                    .core
                    .membership
                    .voter_ids()
                    .into_iter()
                    .filter(|id| id != &self.core.id)
                    .filter_map(|id| self.nodes.get(&id).map(|node| (id, node.matched.index)))
                    .max_by_key(|(_, matched)| *matched)
                    .map(|(id, _)| id);
                match candidate {
                    Some(id) => id,
                    None => {
                        let _ = tx.send(Err(ChangeConfigError::UnknownServer.into()));
                        return;
                    }
                }
            }
        };

        tracing::info!(target, "beginning leadership transfer");
        let expire = Instant::now() + Duration::from_millis(self.core.config.election_timeout_max);
        self.transfer = Some(TransferState {
            target,
            expire,
            timeout_now_sent: false,
            tx: Some(tx),
        });

        let matched = self.nodes.get(&target).map(|node| node.matched.index).unwrap_or(0);
        if matched == self.core.last_log_id.index {
            self.send_timeout_now().await;
        }
    }

    /// Fire the TimeoutNow RPC of a pending transfer whose target has caught up.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn check_transfer_progress(&mut self, target: NodeId, matched: LogId) {
        let ready = matches!(
            &self.transfer,
            Some(transfer) if !transfer.timeout_now_sent
                && transfer.target == target
                && matched.index == self.core.last_log_id.index
        );
        if ready {
            self.send_timeout_now().await;
        }
    }

    /// Abandon a transfer which could not complete within its window; leadership resumes.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn check_transfer_expiry(&mut self) {
        let expired = matches!(&self.transfer, Some(transfer) if Instant::now() >= transfer.expire);
        if expired {
            if let Some(transfer) = self.transfer.take() {
                tracing::warn!(target=transfer.target, "abandoning expired leadership transfer");
                if let Some(tx) = transfer.tx {
                    let _ = tx.send(Err(ChangeConfigError::CatchUpTimeout.into()));
                }
            }
        }
    }

    /// Send the TimeoutNow RPC to the transfer target.
    async fn send_timeout_now(&mut self) {
        let target = match &self.transfer {
            Some(transfer) if !transfer.timeout_now_sent => transfer.target,
            _ => return,
        };
        let rpc = TimeoutNowRequest {
            term: self.core.current_term,
            last_log_index: self.core.last_log_id.index,
            last_log_term: self.core.last_log_id.term,
        };

        match self.core.network.send_timeout_now(target, rpc).await {
            Ok(()) => {
                let last_log_index = self.core.last_log_id.index;
                if let Some(transfer) = self.transfer.as_mut() {
                    transfer.timeout_now_sent = true;
                    if let Some(tx) = transfer.tx.take() {
                        let _ = tx.send(Ok(last_log_index));
                    }
                }
            }
            Err(err) => {
                // Non-fatal: the transfer stays pending and retries on the target's next
                // progress update, or expires.
                tracing::warn!(target, error=%err, "error sending TimeoutNow RPC to transfer target");
            }
        }
    }
}
