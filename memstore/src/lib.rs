//! An in-memory implementation of the `rafter::RaftStorage` trait, used for testing the Raft
//! core without touching a file system.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::sync::Arc;

use anyhow::Result;
use rafter::async_trait::async_trait;
use rafter::membership::Configuration;
use rafter::raft::Entry;
use rafter::raft::EntryPayload;
use rafter::storage::HardState;
use rafter::storage::InitialState;
use rafter::storage::LogState;
use rafter::storage::RaftStorage;
use rafter::storage::RaftStorageDebug;
use rafter::storage::Snapshot;
use rafter::storage::SnapshotMeta;
use rafter::AppData;
use rafter::AppDataResponse;
use rafter::LogId;
use rafter::NodeId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The application data request type which the `MemStore` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client. For a real application, this should be
    /// an enum representing all of the various types of requests / operations which a client
    /// can perform.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application data response type which the `MemStore` works with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// Error used to trigger Raft shutdown from storage.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// The state machine of the `MemStore`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,
    /// A mapping of client IDs to their state info.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,
}

/// An in-memory storage system implementing the `rafter::RaftStorage` trait.
pub struct MemStore {
    /// The ID of the Raft node for which this memory storage instances is configured.
    id: NodeId,
    /// The Raft log.
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    /// The Raft state machine.
    sm: RwLock<MemStoreStateMachine>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The configuration stored by `bootstrap`, at configuration index 0.
    bootstrap_config: RwLock<Option<Configuration>>,
    /// The id of the last entry covered by the current snapshot.
    snapshot_last_log_id: RwLock<LogId>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<Snapshot>>,
}

impl MemStore {
    /// Create a new `MemStore` instance.
    pub fn new(id: NodeId) -> Self {
        let log = RwLock::new(BTreeMap::new());
        let sm = RwLock::new(MemStoreStateMachine::default());
        let hs = RwLock::new(None);
        let current_snapshot = RwLock::new(None);

        Self {
            id,
            log,
            sm,
            hs,
            bootstrap_config: RwLock::new(None),
            snapshot_last_log_id: RwLock::new(LogId::default()),
            current_snapshot,
        }
    }

    /// The ID this store was created for.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Resolve the active membership config: the latest config entry in the log at or below
    /// `upto`, else the snapshot's, else the bootstrap config, else an empty configuration.
    async fn membership_at(&self, upto: u64) -> Configuration {
        let log = self.log.read().await;
        let from_log = log
            .range(..=upto)
            .rev()
            .find_map(|(_, entry)| match &entry.payload {
                EntryPayload::ConfigChange(cfg) => Some((entry.log_id.index, cfg.membership.clone())),
                _ => None,
            });
        if let Some((_, membership)) = from_log {
            return membership;
        }
        if let Some(snapshot) = self.current_snapshot.read().await.as_ref() {
            return snapshot.meta.membership.clone();
        }
        self.bootstrap_config.read().await.clone().unwrap_or_default()
    }

    /// The index of the latest config entry at or below `upto`, 0 if the config predates the log.
    async fn membership_index_at(&self, upto: u64) -> u64 {
        let log = self.log.read().await;
        let from_log = log.range(..=upto).rev().find_map(|(_, entry)| match &entry.payload {
            EntryPayload::ConfigChange(_) => Some(entry.log_id.index),
            _ => None,
        });
        if let Some(index) = from_log {
            return index;
        }
        match self.current_snapshot.read().await.as_ref() {
            Some(snapshot) => snapshot.meta.membership_index,
            None => 0,
        }
    }
}

/// Normalize a range bound pair into a concrete `[start, stop)` pair over log indexes.
fn normalize_range<RNG: RangeBounds<u64>>(range: &RNG) -> (u64, Option<u64>) {
    let start = match range.start_bound() {
        Bound::Included(start) => *start,
        Bound::Excluded(start) => start + 1,
        Bound::Unbounded => 0,
    };
    let stop = match range.end_bound() {
        Bound::Included(stop) => Some(stop + 1),
        Bound::Excluded(stop) => Some(*stop),
        Bound::Unbounded => None,
    };
    (start, stop)
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    type ShutdownError = ShutdownError;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<Configuration> {
        Ok(self.membership_at(u64::MAX).await)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let membership = self.get_membership_config().await?;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let sm = self.sm.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = match log.values().rev().next() {
                    Some(entry) => entry.log_id,
                    None => *self.snapshot_last_log_id.read().await,
                };
                let last_applied_log = sm.last_applied_log;
                Ok(InitialState {
                    last_log_id,
                    last_applied_log,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let new = InitialState {
                    membership,
                    ..InitialState::new_initial()
                };
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, config))]
    async fn bootstrap(&self, config: Configuration) -> Result<()> {
        *self.bootstrap_config.write().await = Some(config);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_state(&self) -> Result<LogState> {
        let log = self.log.read().await;
        let snapshot_last_log_id = *self.snapshot_last_log_id.read().await;
        let last_log_id = match log.values().rev().next() {
            Some(entry) => entry.log_id,
            None => snapshot_last_log_id,
        };
        let first_log_index = match log.keys().next() {
            Some(index) => *index,
            None => last_log_id.index + 1,
        };
        Ok(LogState {
            first_log_index,
            snapshot_last_log_id,
            last_log_id,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, val)| val.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<ClientRequest>>> {
        let log = self.log.read().await;
        Ok(log.get(&log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()> {
        let mut log = self.log.write().await;
        let (start, stop) = normalize_range(&range);
        let keys = match stop {
            Some(stop) => log.range(start..stop).map(|(k, _)| *k).collect::<Vec<_>>(),
            None => log.range(start..).map(|(k, _)| *k).collect::<Vec<_>>(),
        };
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<ClientRequest>]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<ClientRequest>]) -> Result<Vec<ClientResponse>> {
        let mut sm = self.sm.write().await;
        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            // At-most-once per index: entries behind the applied frontier are acknowledged
            // without being re-applied.
            if entry.log_id.index <= sm.last_applied_log.index {
                res.push(ClientResponse(None));
                continue;
            }
            sm.last_applied_log = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(normal) => {
                    let data = &normal.data;
                    if let Some((serial, response)) = sm.client_serial_responses.get(&data.client) {
                        if serial == &data.serial {
                            res.push(ClientResponse(response.clone()));
                            continue;
                        }
                    }
                    let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
                    sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
                    res.push(ClientResponse(previous));
                }
                EntryPayload::Barrier | EntryPayload::ConfigChange(_) => {
                    res.push(ClientResponse(None));
                }
            }
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self, trailing: u64) -> Result<Snapshot> {
        let (data, last_applied_log);
        {
            // Serialize the data of the state machine.
            let sm = self.sm.read().await;
            data = serde_json::to_vec(&*sm)?;
            last_applied_log = sm.last_applied_log;
        }

        let membership = self.membership_at(last_applied_log.index).await;
        let membership_index = self.membership_index_at(last_applied_log.index).await;

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied_log,
                membership_index,
                membership,
            },
            data: Arc::new(data),
        };

        {
            let mut log = self.log.write().await;
            let mut current_snapshot = self.current_snapshot.write().await;
            let mut snapshot_last = self.snapshot_last_log_id.write().await;

            // Prune the log, keeping a trailing tail of entries behind the snapshot.
            let first_retained = last_applied_log.index.saturating_sub(trailing) + 1;
            let keys = log.range(..first_retained).map(|(k, _)| *k).collect::<Vec<_>>();
            for key in keys {
                log.remove(&key);
            }

            *snapshot_last = last_applied_log;
            *current_snapshot = Some(snapshot.clone());
        }

        tracing::trace!({ snapshot_size = snapshot.data.len() }, "log compaction complete");
        Ok(snapshot)
    }

    #[tracing::instrument(level = "trace", skip(self, data))]
    async fn install_snapshot(&self, meta: &SnapshotMeta, data: Vec<u8>) -> Result<()> {
        let new_sm: MemStoreStateMachine = serde_json::from_slice(&data)?;

        let snapshot = Snapshot {
            meta: meta.clone(),
            data: Arc::new(data),
        };

        {
            let mut log = self.log.write().await;
            let mut sm = self.sm.write().await;
            let mut current_snapshot = self.current_snapshot.write().await;
            let mut snapshot_last = self.snapshot_last_log_id.write().await;

            // Drop everything the snapshot covers; entries beyond it are reconciled by the
            // leader's next AppendEntries.
            let keys = log.range(..=meta.last_log_id.index).map(|(k, _)| *k).collect::<Vec<_>>();
            for key in keys {
                log.remove(&key);
            }

            *sm = new_sm;
            sm.last_applied_log = meta.last_log_id;
            *snapshot_last = meta.last_log_id;
            *current_snapshot = Some(snapshot);
        }

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.current_snapshot.read().await.clone())
    }
}

#[async_trait]
impl RaftStorageDebug<MemStoreStateMachine> for MemStore {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }
}
