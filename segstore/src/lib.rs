//! A segmented on-disk implementation of the `rafter::RaftStorage` trait.
//!
//! One directory holds everything a replica persists: the term/vote metadata file, the
//! append-only segmented log (preallocated `open-<counter>` segments sealed into immutable
//! `<first>-<last>` segments), and snapshot metadata+data pairs. The application supplies its
//! deterministic state machine through the [`StateMachine`] trait; everything else — checksums,
//! crash recovery, truncation, compaction, snapshot pruning — is handled here.

pub mod codec;
pub mod inmem;
pub mod meta;
pub mod prepare;
pub mod segment;
pub mod snapshot;
pub mod wal;

use std::fmt::Debug;
use std::fs;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rafter::async_trait::async_trait;
use rafter::membership::Configuration;
use rafter::raft::Entry;
use rafter::raft::EntryConfigChange;
use rafter::raft::EntryNormal;
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
use rafter::StorageError;
use tokio::sync::RwLock;

use crate::codec::DiskEntry;
use crate::codec::EntryKind;
use crate::inmem::InMemLog;
use crate::meta::MetaState;
use crate::snapshot::SnapshotStore;
use crate::wal::SegmentedLog;

/// The deterministic state machine supplied by the application.
///
/// Commands arrive in strictly increasing index order, each index at most once. `snapshot` and
/// `restore` transfer the complete machine state as opaque bytes.
pub trait StateMachine<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Apply one committed command and produce its response.
    fn apply(&mut self, index: u64, data: &D) -> R;

    /// The response used for entries which carry no command: barriers, configuration changes,
    /// and commands which were already applied before a restart.
    fn blank_response(&self) -> R;

    /// Serialize the full machine state.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the machine state with a previously serialized one.
    fn restore(&mut self, data: &[u8]) -> Result<(), StorageError>;
}

/// Error used to trigger Raft shutdown from storage.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("unsafe storage error")]
    UnsafeStorageError,
}

/// Sizing options for segment files.
#[derive(Clone, Copy, Debug)]
pub struct SegStoreOptions {
    /// The block size segments are sized in.
    pub block_size: u64,
    /// How many blocks one segment spans.
    pub blocks_per_segment: u64,
}

impl Default for SegStoreOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_per_segment: 64,
        }
    }
}

impl SegStoreOptions {
    fn segment_size(&self) -> u64 {
        self.block_size * self.blocks_per_segment
    }
}

struct Inner<D: AppData, M> {
    log: InMemLog<D>,
    wal: SegmentedLog,
    meta: MetaState,
    sm: M,
    last_applied: LogId,
    current_snapshot: Option<Snapshot>,
    shutdown: bool,
}

impl<D: AppData, M> Inner<D, M> {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.shutdown {
            return Err(StorageError::Shutdown);
        }
        Ok(())
    }

    /// Resolve the active membership at or below `upto`: the latest config entry in the log,
    /// else the snapshot's, else the bootstrap configuration.
    fn membership_at(&self, upto: u64) -> (u64, Configuration) {
        let from_log = self.log.iter().rev().filter(|entry| entry.log_id.index <= upto).find_map(|entry| {
            match &entry.payload {
                EntryPayload::ConfigChange(cfg) => Some((entry.log_id.index, cfg.membership.clone())),
                _ => None,
            }
        });
        if let Some(found) = from_log {
            return found;
        }
        if let Some(snapshot) = &self.current_snapshot {
            return (snapshot.meta.membership_index, snapshot.meta.membership.clone());
        }
        match &self.meta.bootstrap {
            Some((index, config)) => (*index, config.clone()),
            None => (0, Configuration::default()),
        }
    }
}

/// A `RaftStorage` implementation over segmented log files, a snapshot store and an atomic
/// metadata file, all within one directory owned exclusively by this replica.
pub struct SegStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    dir: PathBuf,
    inner: RwLock<Inner<D, M>>,
    marker_r: std::marker::PhantomData<R>,
}

impl<D, R, M> SegStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    /// Open the store, recovering whatever the directory holds.
    ///
    /// The given state machine must be in its initial state; it is restored from the latest
    /// snapshot if one exists. Recovery validates every closed segment's checksums, repairs a
    /// torn tail in the active segment, and removes crash residue (orphaned snapshot metadata,
    /// contentless open segments).
    #[tracing::instrument(level = "debug", skip(options, sm))]
    pub async fn open(dir: PathBuf, options: SegStoreOptions, mut sm: M) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;

        let meta_state = meta::load(&dir)?.unwrap_or_default();
        let snapshots = SnapshotStore::new(&dir);
        let snapshot = snapshots.load_latest()?;
        let snapshot_last = snapshot.as_ref().map(|(meta, _)| meta.last_log_id).unwrap_or_default();

        let mut recovered = SegmentedLog::load(&dir, options.segment_size())?;

        let mut entries = Vec::with_capacity(recovered.entries.len());
        if !recovered.entries.is_empty() {
            if recovered.first_index > snapshot_last.index + 1 {
                return Err(StorageError::Corrupt(format!(
                    "log starts at {} but the snapshot covers only up to {}",
                    recovered.first_index, snapshot_last.index
                )));
            }
            let last_recovered = recovered.first_index + recovered.entries.len() as u64 - 1;
            if last_recovered < snapshot_last.index {
                // Stale leftovers entirely behind the snapshot boundary, from an installed
                // snapshot; the snapshot supersedes them.
                tracing::debug!(last_recovered, boundary = snapshot_last.index, "discarding log behind snapshot");
                recovered.log.truncate(recovered.first_index).await?;
            } else {
                for (i, disk) in recovered.entries.iter().enumerate() {
                    let index = recovered.first_index + i as u64;
                    entries.push(decode_entry(index, disk)?);
                }
            }
        }

        if let Some((_, data)) = &snapshot {
            sm.restore(data)?;
        }
        let current_snapshot = snapshot.map(|(meta, data)| Snapshot {
            meta,
            data: Arc::new(data),
        });

        let inner = Inner {
            log: InMemLog::load(entries, snapshot_last),
            wal: recovered.log,
            meta: meta_state,
            sm,
            last_applied: snapshot_last,
            current_snapshot,
            shutdown: false,
        };
        Ok(Self {
            dir,
            inner: RwLock::new(inner),
            marker_r: std::marker::PhantomData,
        })
    }

    /// Shut the store down: the prepare pool is drained and unlinked, pending prepares fail
    /// with `Canceled`, and every later operation fails with `Shutdown`.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        if inner.shutdown {
            return;
        }
        inner.shutdown = true;
        inner.wal.close().await;
    }

    /// A point-in-time view of the prepare pool, for diagnostics and tests.
    pub async fn pool_stats(&self) -> Result<prepare::PoolStats, StorageError> {
        let inner = self.inner.read().await;
        inner.wal.pool().stats().await
    }

    /// The sealed segment ranges currently on disk, for diagnostics and tests.
    pub async fn closed_segment_ranges(&self) -> Vec<(u64, u64)> {
        let inner = self.inner.read().await;
        inner.wal.closed_segments().iter().map(|info| (info.first, info.last)).collect()
    }

    async fn persist_meta(&self, state: MetaState) -> Result<(), StorageError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || meta::store(&dir, &state))
            .await
            .map_err(|_| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "metadata write task failed")))?
    }
}

fn decode_entry<D: AppData>(index: u64, disk: &DiskEntry) -> Result<Entry<D>, StorageError> {
    let payload = match disk.kind {
        EntryKind::Command => EntryPayload::Normal(EntryNormal {
            data: serde_json::from_slice(&disk.payload)
                .map_err(|err| StorageError::Corrupt(format!("undecodable command payload at index {}: {}", index, err)))?,
        }),
        EntryKind::Barrier => EntryPayload::Barrier,
        EntryKind::Configuration => EntryPayload::ConfigChange(EntryConfigChange {
            membership: Configuration::decode(&disk.payload)?,
        }),
    };
    Ok(Entry {
        log_id: LogId::new(disk.term, index),
        payload,
    })
}

fn encode_entry<D: AppData>(entry: &Entry<D>) -> Result<DiskEntry, StorageError> {
    let (kind, payload) = match &entry.payload {
        EntryPayload::Normal(normal) => (
            EntryKind::Command,
            serde_json::to_vec(&normal.data)
                .map_err(|err| StorageError::Corrupt(format!("unencodable command payload: {}", err)))?,
        ),
        EntryPayload::Barrier => (EntryKind::Barrier, Vec::new()),
        EntryPayload::ConfigChange(cfg) => (EntryKind::Configuration, cfg.membership.encode()),
    };
    Ok(DiskEntry {
        term: entry.log_id.term,
        kind,
        payload,
    })
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
impl<D, R, M> RaftStorage<D, R> for SegStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    type ShutdownError = ShutdownError;

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_membership_config(&self) -> Result<Configuration> {
        let inner = self.inner.read().await;
        Ok(inner.membership_at(u64::MAX).1)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        Ok(InitialState {
            last_log_id: inner.log.last_log_id(),
            last_applied_log: inner.last_applied,
            hard_state: inner.meta.hard_state.clone(),
            membership: inner.membership_at(u64::MAX).1,
        })
    }

    #[tracing::instrument(level = "trace", skip(self, hs))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        inner.meta.hard_state = hs.clone();
        let state = inner.meta.clone();
        drop(inner);
        self.persist_meta(state).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, config))]
    async fn bootstrap(&self, config: Configuration) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        inner.meta.bootstrap = Some((0, config));
        let state = inner.meta.clone();
        drop(inner);
        self.persist_meta(state).await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_state(&self) -> Result<LogState> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        Ok(LogState {
            first_log_index: inner.log.first_index(),
            snapshot_last_log_id: inner.log.snapshot_last_log_id(),
            last_log_id: inner.log.last_log_id(),
        })
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry<D>>> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        let (start, stop) = normalize_range(&range);
        let stop = stop.unwrap_or(inner.log.last_log_id().index + 1);
        Ok(inner.log.range(start, stop))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry<D>>> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        Ok(inner.log.get(log_index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self, range))]
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;
        // Deletion is suffix truncation; the lock is the write barrier that drains other writes.
        let (start, _) = normalize_range(&range);
        inner.wal.truncate(start).await?;
        inner.log.truncate(start);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_to_log(&self, entries: &[&Entry<D>]) -> Result<()> {
        let first = match entries.first() {
            Some(entry) => entry.log_id.index,
            None => return Ok(()),
        };

        let mut inner = self.inner.write().await;
        inner.ensure_open()?;

        let mut disk_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            disk_entries.push(encode_entry(entry)?);
        }

        for entry in entries {
            inner.log.append((*entry).clone());
        }

        // In-memory and durable appends happen under the same barrier; an error rolls the
        // in-memory tail back before anyone can observe it.
        if let Err(err) = inner.wal.append(first, &disk_entries).await {
            inner.log.truncate(first);
            return Err(err.into());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn apply_to_state_machine(&self, entries: &[&Entry<D>]) -> Result<Vec<R>> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;

        let mut res = Vec::with_capacity(entries.len());
        for entry in entries {
            // At-most-once per index: entries behind the applied frontier are acknowledged
            // without being re-applied.
            if entry.log_id.index <= inner.last_applied.index {
                res.push(inner.sm.blank_response());
                continue;
            }
            inner.last_applied = entry.log_id;
            match &entry.payload {
                EntryPayload::Normal(normal) => {
                    let index = entry.log_id.index;
                    let response = inner.sm.apply(index, &normal.data);
                    res.push(response);
                }
                EntryPayload::Barrier | EntryPayload::ConfigChange(_) => {
                    res.push(inner.sm.blank_response());
                }
            }
        }
        Ok(res)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn do_log_compaction(&self, trailing: u64) -> Result<Snapshot> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;

        let boundary = inner.last_applied;
        if boundary.index == 0 {
            return Err(StorageError::NotFound("nothing applied yet, nothing to snapshot".into()).into());
        }

        let data = inner.sm.snapshot();
        let (membership_index, membership) = inner.membership_at(boundary.index);
        let snapshot_meta = SnapshotMeta {
            last_log_id: boundary,
            membership_index,
            membership,
        };

        {
            let snapshots = SnapshotStore::new(&self.dir);
            let meta_clone = snapshot_meta.clone();
            let data_clone = data.clone();
            tokio::task::spawn_blocking(move || snapshots.put(&meta_clone, &data_clone))
                .await
                .map_err(|_| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "snapshot write task failed")))??;
        }

        // Prune the log, keeping a trailing tail of entries behind the snapshot.
        let first_retained = boundary.index.saturating_sub(trailing) + 1;
        inner.wal.compact(first_retained).await?;
        inner.log.compact(first_retained, boundary);

        let snapshot = Snapshot {
            meta: snapshot_meta,
            data: Arc::new(data),
        };
        inner.current_snapshot = Some(snapshot.clone());

        tracing::debug!(boundary=%boundary, first_retained, "log compaction complete");
        Ok(snapshot)
    }

    #[tracing::instrument(level = "trace", skip(self, meta, data))]
    async fn install_snapshot(&self, meta: &SnapshotMeta, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.ensure_open()?;

        inner.sm.restore(&data)?;

        {
            let snapshots = SnapshotStore::new(&self.dir);
            let meta_clone = meta.clone();
            let data_clone = data.clone();
            tokio::task::spawn_blocking(move || snapshots.put(&meta_clone, &data_clone))
                .await
                .map_err(|_| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "snapshot write task failed")))??;
        }

        let boundary = meta.last_log_id;
        if inner.log.last_log_id().index <= boundary.index {
            // Everything this node holds is superseded by the snapshot: drop the log whole, so
            // the next append starts a fresh segment right above the boundary.
            let first = inner.log.first_index();
            inner.wal.truncate(first).await?;
        } else {
            // The log extends past the snapshot. Sealed segments entirely covered by it are
            // gone; entries the active segment holds at or below the boundary are tolerated by
            // recovery as a trailing tail.
            inner.wal.compact(boundary.index + 1).await?;
        }
        inner.log.snapshot_restored(boundary);
        inner.last_applied = boundary;
        inner.current_snapshot = Some(Snapshot {
            meta: meta.clone(),
            data: Arc::new(data),
        });
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_current_snapshot(&self) -> Result<Option<Snapshot>> {
        let inner = self.inner.read().await;
        inner.ensure_open()?;
        Ok(inner.current_snapshot.clone())
    }
}

#[async_trait]
impl<D, R, M> RaftStorageDebug<M> for SegStore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R> + Clone,
{
    /// Get a handle to the state machine for testing purposes.
    async fn get_state_machine(&self) -> M {
        let inner = self.inner.read().await;
        inner.sm.clone()
    }

    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState> {
        let inner = self.inner.read().await;
        Some(inner.meta.hard_state.clone())
    }
}
