use std::sync::Arc;

use crate::core::LeaderState;
use crate::core::State;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::raft::ResponseTx;
use crate::replication::RaftEvent;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

/// A wrapper around a ClientRequest which has been transformed into an Entry, along with its response channel.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response channel for the request.
    pub tx: ClientOrInternalResponseTx<D, R>,
}

impl<D: AppData, R: AppDataResponse> ClientRequestEntry<D, R> {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry<T: Into<ClientOrInternalResponseTx<D, R>>>(entry: Entry<D>, tx: T) -> Self {
        Self {
            entry: Arc::new(entry),
            tx: tx.into(),
        }
    }

    /// Fail this request with a not-leader error, used when leadership is lost before commitment.
    pub(crate) fn fail_not_leader(self, current_leader: Option<NodeId>) {
        match self.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                if let EntryPayload::Normal(entry) = &self.entry.payload {
                    let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data.clone(), current_leader)));
                }
            }
            ClientOrInternalResponseTx::Internal(Some(tx)) => {
                let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(current_leader).into()));
            }
            ClientOrInternalResponseTx::Internal(None) => {}
        }
    }
}

/// An enum type wrapping either a client response channel or an internal Raft response channel.
#[derive(derive_more::From)]
pub enum ClientOrInternalResponseTx<D: AppData, R: AppDataResponse> {
    Client(ClientWriteResponseTx<D, R>),
    Internal(Option<ResponseTx>),
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    ///
    /// The barrier carries the new term and, once committed, commits every residual entry of
    /// prior terms along with it. An uncommitted config entry inherited from a previous leader
    /// is already the active configuration and simply commits under the barrier.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let req: ClientWriteRequest<D> = ClientWriteRequest::new_barrier();

        let entry = self.append_payload_to_log(req.entry).await?;
        self.core.last_log_id.term = self.core.current_term; // This only ever needs to be updated once per term.

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(
        &mut self,
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    ) {
        // A leader in the middle of handing off its leadership refuses new writes.
        if self.transfer.is_some() {
            if let EntryPayload::Normal(entry) = rpc.entry {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(entry.data, None)));
            }
            return;
        }

        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, tx),
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Handle a client barrier request.
    ///
    /// The barrier resolves with its log index once it has been committed and applied, at which
    /// point every preceding entry has been applied as well.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_barrier_request(&mut self, tx: ResponseTx) {
        if self.transfer.is_some() {
            let _ = tx.send(Err(ChangeConfigError::NodeNotLeader(None).into()));
            return;
        }

        let req = ClientWriteRequest::<D>::new_barrier();
        let entry = match self.append_payload_to_log(req.entry).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, Some(tx)),
            Err(err) => {
                let _ = tx.send(Err(ResponseError::from(ChangeConfigError::RaftError(err))));
                return;
            }
        };
        self.replicate_client_request(entry).await;
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) {
        let entry_arc = req.entry.clone();
        self.awaiting_committed.push(req);

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }

        // With a voter quorum of one — a single-node cluster, or a leader with only
        // standbys — the entry is committed by the local append alone.
        let _ = self.try_advance_commit_index().await;
    }

    /// Handle the post-commit logic for a client request.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        let entry = &req.entry;

        match req.tx {
            ClientOrInternalResponseTx::Client(tx) => {
                match &entry.payload {
                    EntryPayload::Normal(_) => match self.apply_entry_to_state_machine(entry).await {
                        Ok(data) => {
                            let _ = tx.send(Ok(ClientWriteResponse {
                                index: req.entry.log_id.index,
                                data,
                            }));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(ClientWriteError::RaftError(err)));
                        }
                    },
                    _ => {
                        // Why is this a bug, and why are we shutting down? This is because we can not easily
                        // encode these constraints in the type system, and client requests should be the only
                        // log entry types for which a `ClientOrInternalResponseTx::Client` type is used. This
                        // error should never be hit unless we've done a poor job in code review.
                        tracing::error!("critical error in Raft, this is a programming bug, please open an issue");
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
            ClientOrInternalResponseTx::Internal(tx) => {
                self.handle_special_log(entry).await;

                let res = self.apply_entry_to_state_machine(entry).await;
                let res = match res {
                    Ok(_data) => Ok(entry.log_id.index),
                    Err(err) => {
                        tracing::error!("res of applying to state machine: {:?}", err);
                        Err(err)
                    }
                };

                match tx {
                    None => {
                        tracing::debug!("no response tx to send res");
                    }

                    Some(tx) => {
                        let send_res = tx.send(res.map_err(|err| ResponseError::from(ChangeConfigError::RaftError(err))));
                        tracing::debug!("send internal response through tx, res: {:?}", send_res);
                    }
                }
            }
        }

        // Trigger log compaction if needed.
        self.core.trigger_log_compaction_if_needed(false);
    }

    /// Handle the commitment of entries which carry cluster-level side effects.
    pub(super) async fn handle_special_log(&mut self, entry: &Arc<Entry<D>>) {
        match &entry.payload {
            EntryPayload::ConfigChange(_) => {
                self.handle_config_entry_committed(entry.log_id.index).await;
            }
            EntryPayload::Barrier => {}
            EntryPayload::Normal(_) => {}
        }
    }

    /// Apply the given log entry to the state machine.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, entry: &Entry<D>) -> RaftResult<R> {
        // First, we just ensure that we apply any outstanding up to, but not including, the index
        // of the given entry. We need to be able to return the data response from applying this
        // entry to the state machine.
        //
        // Note that this would only ever happen if a node had unapplied logs from before becoming leader.

        let log_id = &entry.log_id;
        let index = log_id.index;

        let expected_next_index = self.core.last_applied.index + 1;
        if index != expected_next_index {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next_index..index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;

            if let Some(entry) = entries.last() {
                self.core.last_applied = entry.log_id;
            }

            let data_entries: Vec<_> = entries.iter().collect();
            if !data_entries.is_empty() {
                self.core
                    .storage
                    .apply_to_state_machine(&data_entries)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
            }
        }

        // Before we can safely apply this entry to the state machine, we need to ensure there is
        // no pending task to replicate entries to the state machine. This is edge case, and would only
        // happen once very early in a new leader's term.
        if !self.core.replicate_to_sm_handle.is_empty() {
            if let Some(Ok(replicate_to_sm_result)) = futures::StreamExt::next(&mut self.core.replicate_to_sm_handle).await {
                self.core.handle_replicate_to_sm_result(replicate_to_sm_result)?;
            }
        }

        // Apply this entry to the state machine and return its data response.
        let res = self.core.storage.apply_to_state_machine(&[entry]).await.map_err(|err| {
            if err.downcast_ref::<S::ShutdownError>().is_some() {
                // If this is an instance of the storage impl's shutdown error, then trigger shutdown.
                self.core.map_fatal_storage_error(err)
            } else {
                // Else, we propagate normally.
                RaftError::RaftStorage(err)
            }
        });

        self.core.last_applied = *log_id;
        self.leader_report_metrics();
        let res = res?;

        res.into_iter().next().ok_or_else(|| RaftError::RaftStorage(anyhow::anyhow!("state machine returned no response for applied entry")))
    }
}
