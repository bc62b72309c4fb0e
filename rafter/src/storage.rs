//! The Raft storage interface and data types.

use std::error::Error;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::Configuration;
use crate::raft::Entry;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;

/// The metadata of a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Log entries upto which this snapshot includes, inclusive.
    pub last_log_id: LogId,

    /// The raft index at which the covered membership configuration was chosen.
    pub membership_index: u64,

    /// The latest membership configuration covered by the snapshot.
    pub membership: Configuration,
}

/// A snapshot: its metadata plus the opaque state machine payload.
///
/// Snapshots are transferred to lagging followers in a single InstallSnapshot message, so the
/// payload is held as one buffer. The `Arc` keeps handing a snapshot to several replication
/// streams cheap.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Metadata of the snapshot.
    pub meta: SnapshotMeta,

    /// The opaque state machine payload.
    pub data: Arc<Vec<u8>>,
}

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// The boundary state of the log held by a store.
///
/// The log retains entries in `[first_log_index ..= last_log_id.index]`. The first retained
/// index may lie at or below the snapshot boundary when a compaction keeps a trailing tail of
/// entries behind the snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogState {
    /// The first index still present in the log, `last + 1` if the log is empty.
    pub first_log_index: u64,
    /// The id of the last entry covered by the current snapshot, `(0, 0)` if none.
    pub snapshot_last_log_id: LogId,
    /// The id of the last entry in the log, or the snapshot boundary if the log is empty.
    pub last_log_id: LogId,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry.
    pub last_log_id: LogId,

    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The latest cluster membership configuration found in the log or snapshot, else the
    /// bootstrap configuration, else an empty configuration for a pristine node.
    pub membership: Configuration,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
            membership: Configuration::default(),
        }
    }
}

/// A trait defining the interface for a Raft storage system.
///
/// This is the contract between the consensus core and its durable backend: the term/vote record,
/// the log, the snapshot store and the application state machine all live behind it. Two
/// implementations ship in this workspace — `segstore` (segmented on-disk files) and `memstore`
/// (in-memory, for tests) — and applications are free to provide their own.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The error type used to indicate to Raft that shutdown is needed when calling the
    /// `apply_to_state_machine` method.
    ///
    /// This error type is only considered for the `apply_to_state_machine` method as it is
    /// the only method which is allowed to return errors normally as part of application logic.
    ///
    /// For all other methods of this trait, returning an error will cause Raft to shutdown.
    type ShutdownError: Error + Send + Sync + 'static;

    /// Get the latest membership config found in the log or snapshot.
    ///
    /// This must always be implemented as a reverse search through the log to find the most
    /// recent membership config to be appended to the log. If no config entry exists in the
    /// log, the config covered by the current snapshot is used, then the bootstrap config,
    /// then an empty configuration for a pristine store.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_membership_config(&self) -> Result<Configuration>;

    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on the storage system to
    /// fetch the last known state from stable storage. If no such entry exists due to being the
    /// first time the node has come online, then `InitialState::new_initial` should be used.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state.
    ///
    /// The write must be atomic and durable before this returns: once a term or a vote has been
    /// handed out, no crash may rewind it.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Seed a pristine store with the given cluster configuration.
    ///
    /// The configuration is recorded at configuration index 0, outside the log: the log of a
    /// bootstrapped node stays empty until its first leader appends the initial barrier.
    async fn bootstrap(&self, config: Configuration) -> Result<()>;

    /// Get the boundary state of the log: its first retained index, the snapshot boundary and
    /// the last log id.
    ///
    /// Replication uses this to detect that a follower needs entries which have been compacted
    /// away and must receive a snapshot instead, and to resolve the term of the entry preceding
    /// a send when that entry is the snapshot boundary itself.
    async fn get_log_state(&self) -> Result<LogState>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive: `[start, stop)`.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>>;

    /// Try to get a log entry.
    ///
    /// It does not return an error if the log entry at `log_index` is not found; entries below
    /// the snapshot boundary simply yield `None`.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>>;

    /// Delete all logs in a `range`.
    ///
    /// This is suffix truncation: it is only ever invoked under the core's write barrier, for
    /// conflict resolution and snapshot installation, and must not complete while writes to the
    /// removed range are still outstanding.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()>;

    /// Apply the given payload of entries to the state machine.
    ///
    /// The Raft protocol guarantees that only logs which have been _committed_, that is, logs
    /// which have been replicated to a majority of the cluster, will be applied to the state
    /// machine. Entries are presented in strictly increasing index order and each index is
    /// applied at most once.
    ///
    /// An impl should apply `EntryPayload::Normal` entries to the application state machine, and
    /// record the advance of the applied index for `Barrier` and `ConfigChange` entries without
    /// touching application state.
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>>;

    /// Perform log compaction, returning a handle to the generated snapshot.
    ///
    /// Compaction covers the log up to the last applied entry. After the snapshot is durable,
    /// the impl prunes the log but keeps `trailing` entries behind the snapshot so that slightly
    /// lagging followers can still catch up from the log.
    ///
    /// Errors returned from this method will be logged and retried.
    async fn do_log_compaction(&self, trailing: u64) -> Result<Snapshot>;

    /// Install a full snapshot received from the cluster leader.
    ///
    /// The impl must make the snapshot durable, truncate the log through `meta.last_log_id`,
    /// restore the state machine from `data`, and adopt `meta.membership`. Prior snapshots may
    /// be pruned afterwards.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn install_snapshot(&self, meta: &SnapshotMeta, data: Vec<u8>) -> Result<()>;

    /// Get the current snapshot, along with its metadata.
    ///
    /// A proper implementation will store the term, index and membership config as part
    /// of the snapshot, which should be decoded for creating this method's response data.
    ///
    /// Errors returned from this method will cause Raft to go into shutdown.
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait RaftStorageDebug<SM> {
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> SM;

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
