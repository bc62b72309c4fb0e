//! Replication stream.

use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::config::Config;
use crate::raft::AppendEntriesRequest;
use crate::raft::Entry;
use crate::raft::InstallSnapshotRequest;
use crate::storage::Snapshot;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream<D: AppData> {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(RaftEvent<D>, Span)>,
}

impl<D: AppData> ReplicationStream<D> {
    /// Create a new replication stream for the target peer.
    pub(crate) fn new<R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> Self {
        ReplicationCore::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            network,
            storage,
            replication_tx,
        )
    }
}

/// The per-follower progress record of the leader.
///
/// `next_index` is the next log index to send, `matched` the highest entry known replicated on
/// the target. `next_index` never drops below `matched.index + 1`, and `matched` only ever
/// advances.
pub(crate) struct Progress {
    /// The state of the replication stream towards this follower.
    pub state: ProgressState,
    /// The index of the next log to send.
    ///
    /// This is initialized to leader's last log index + 1. Per the Raft protocol spec,
    /// this value may be decremented as new nodes enter the cluster and need to catch-up per the
    /// log consistency check.
    pub next_index: u64,
    /// The last known log to be successfully replicated on the target.
    pub matched: LogId,
    /// The time the last AppendEntries was dispatched to the target.
    pub last_send: Option<Instant>,
    /// Whether the target has sent back any response since this flag was last cleared.
    pub recent_recv: bool,
}

impl Progress {
    /// Create the progress record for a fresh leadership: probe from the leader's end of log.
    pub fn new(leader_last_log_index: u64) -> Self {
        Self {
            state: ProgressState::Probe,
            next_index: leader_last_log_index + 1,
            matched: LogId::new(0, 0),
            last_send: None,
            recent_recv: false,
        }
    }

    /// Record a successful replication up to (and including) the given log id.
    ///
    /// A probing stream is promoted to pipeline once a round trip succeeds.
    pub fn handle_success(&mut self, last: LogId) {
        if last > self.matched {
            self.matched = last;
        }
        self.next_index = self.matched.index + 1;
        if self.state == ProgressState::Probe {
            self.state = ProgressState::Pipeline;
        }
    }

    /// Record a rejection carrying the follower's reported last log index.
    ///
    /// The next probe backs off by one, capped by the follower's end of log so a freshly wiped
    /// follower is reached in a single step instead of one round trip per missing entry.
    pub fn handle_rejection(&mut self, follower_last_log_index: u64) {
        let mut next = std::cmp::min(self.next_index.saturating_sub(1), follower_last_log_index + 1);
        if next <= self.matched.index {
            next = self.matched.index + 1;
        }
        self.next_index = std::cmp::max(next, 1);
        self.state = ProgressState::Probe;
    }
}

/// The state of a replication stream.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ProgressState {
    /// Probing for the follower's match point, one payload per round trip.
    Probe,
    /// The follower is in sync; entries are streamed as they are appended.
    Pipeline,
    /// The follower needs entries which have been compacted away; a snapshot is being sent.
    Snapshotting,
    /// The replication stream is shutting down.
    Shutdown,
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could result in
/// out-of-order delivery. We always buffer until we receive a success response, then send the
/// next payload from the buffer.
struct ReplicationCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the Raft node.
    raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent<D>, Span)>,

    /// The `RaftNetwork` interface.
    network: Arc<N>,

    /// The `RaftStorage` interface.
    storage: Arc<S>,

    /// The Raft's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,
    marker_r: std::marker::PhantomData<R>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The progress of the target follower.
    progress: Progress,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,

    /// A buffer of data to replicate to the target follower.
    ///
    /// The buffered payload here will be expanded as more replication commands come in from the
    /// Raft node. Data from this buffer will flow into the `outbound_buffer` in chunks.
    replication_buffer: Vec<Arc<Entry<D>>>,
    /// A buffer of data which is being sent to the follower.
    ///
    /// Data in this buffer comes directly from the `replication_buffer` in chunks, and will
    /// remain here until it is confirmed that the payload has been successfully received by the
    /// target node. This allows for retransmission of payloads in the face of transient errors.
    outbound_buffer: Vec<OutboundEntry<D>>,
    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,

    /// The timeout duration for heartbeats.
    heartbeat_timeout: Duration,

    /// The timeout for sending a snapshot.
    install_snapshot_timeout: Duration,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    /// Spawn a new replication task for the target node.
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        raft_core_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,
    ) -> ReplicationStream<D> {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);

        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            max_payload_entries,
            marker_r: std::marker::PhantomData,
            progress: Progress::new(last_log.index),
            last_log_index: last_log.index,
            commit_index,
            raft_core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial probe, which also serves as the first heartbeat.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            match &self.progress.state {
                ProgressState::Pipeline => self.pipeline_loop().await,
                ProgressState::Probe => self.probe_loop().await,
                ProgressState::Snapshotting => SnapshottingState::new(&mut self).run().await,
                ProgressState::Shutdown => return,
            }
        }
    }

    /// Resolve the log id of the entry preceding `next_index`.
    ///
    /// The term comes from the log, or from the snapshot boundary when the predecessor is the
    /// snapshot's last covered entry. A predecessor below the first retained log index means the
    /// follower can no longer be served from the log, so the stream transitions to snapshotting
    /// and `None` is returned.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prev_log_id(&mut self) -> Option<LogId> {
        let prev_index = self.progress.next_index.saturating_sub(1);
        if prev_index == 0 {
            return Some(LogId::new(0, 0));
        }

        let log_state = match self.storage.get_log_state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error=%err, "error fetching log state from storage");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.progress.state = ProgressState::Shutdown;
                return None;
            }
        };

        if prev_index == log_state.snapshot_last_log_id.index {
            return Some(log_state.snapshot_last_log_id);
        }
        if prev_index < log_state.first_log_index {
            self.progress.state = ProgressState::Snapshotting;
            return None;
        }

        match self.storage.try_get_log_entry(prev_index).await {
            Ok(Some(entry)) => Some(entry.log_id),
            Ok(None) => {
                // The entry was compacted away between the boundary check and the fetch.
                self.progress.state = ProgressState::Snapshotting;
                None
            }
            Err(err) => {
                tracing::error!(error=%err, "error fetching log entry for prev_log_id");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.progress.state = ProgressState::Shutdown;
                None
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// This request will timeout if no response is received within the
    /// configured heartbeat interval.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = std::cmp::min(repl_len, self.max_payload_entries);
                self.outbound_buffer.extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        let prev_log_id = match self.prev_log_id().await {
            Some(prev) => prev,
            None => return,
        };

        // Build the heartbeat frame to be sent to the follower.
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            leader_commit: self.commit_index,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };

        // Send the payload.
        tracing::debug!("start sending append_entries, timeout: {:?}", self.heartbeat_timeout);
        self.progress.last_send = Some(Instant::now());
        let res = match timeout(
            self.heartbeat_timeout,
            self.network.send_append_entries(self.target, payload),
        )
        .await
        {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, last_send=?self.progress.last_send, "timeout while sending AppendEntries RPC to target");
                return;
            }
        };
        self.progress.recent_recv = true;

        // A newer term in the response deposes the leader; this is checked before anything else.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.progress.state = ProgressState::Shutdown;
            return;
        }

        if res.is_success() {
            let last = self.outbound_buffer.last().map(|entry| entry.as_ref().log_id).unwrap_or(prev_log_id);
            tracing::debug!("append entries succeeded to {:?}", last);

            // Once we've successfully sent a payload of entries, don't send them again.
            self.outbound_buffer.clear();
            self.progress.handle_success(last);
            let _ = self.raft_core_tx.send((
                ReplicaEvent::UpdateMatched {
                    target: self.target,
                    matched: self.progress.matched,
                },
                tracing::debug_span!("CH"),
            ));

            // If our buffered outbound requests have accumulated too much while running in
            // pipeline mode, purge and transition to probe. The target is not able to
            // replicate data fast enough.
            let is_lagging = self
                .last_log_index
                .checked_sub(self.progress.matched.index)
                .map(|diff| diff > self.config.replication_lag_threshold)
                .unwrap_or(false);
            if is_lagging {
                self.progress.state = ProgressState::Probe;
            }
            return;
        }

        // The follower rejected on `prev_log_id`: back the probe off, bounded by the
        // follower's reported end of log.
        tracing::debug!(rejected=res.rejected, follower_last=res.last_log_index, "append entries rejected, probing backwards");
        self.outbound_buffer.clear();
        self.progress.handle_rejection(res.last_log_index);
    }

    /// Send an empty AppendEntries as a pure heartbeat, anchored at the follower's match point.
    ///
    /// Used while a snapshot transfer is pending so the follower's election timer keeps getting
    /// reset even though no log entries can be sent.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_heartbeat(&mut self) {
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.progress.matched,
            leader_commit: self.commit_index,
            entries: vec![],
        };
        self.progress.last_send = Some(Instant::now());
        let res = match timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, payload)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending heartbeat to target");
                return;
            }
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending heartbeat to target");
                return;
            }
        };
        self.progress.recent_recv = true;
        if res.term > self.term {
            let _ = self.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.progress.state = ProgressState::Shutdown;
        }
    }

    /// Fully drain the channel coming in from the Raft node.
    pub(self) fn drain_raft_rx(&mut self, first: RaftEvent<D>, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            // Unpack the event opt, else return if we don't have one to process.
            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };

            let _ent = span.enter();

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }

                RaftEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.progress.state == ProgressState::Pipeline {
                        self.replication_buffer.push(entry);
                    }
                }

                RaftEvent::Terminate => {
                    self.progress.state = ProgressState::Shutdown;
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }
}

/// A type which wraps two possible forms of an outbound entry for replication.
enum OutboundEntry<D: AppData> {
    /// An entry owned by an Arc, hot off the replication stream from the Raft leader.
    Arc(Arc<Entry<D>>),
    /// An entry which was fetched directly from storage.
    Raw(Entry<D>),
}

impl<D: AppData> AsRef<Entry<D>> for OutboundEntry<D> {
    fn as_ref(&self) -> &Entry<D> {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An event from the Raft node.
pub(crate) enum RaftEvent<D: AppData> {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to the log, so its
        /// index is the new last_log_index value.
        entry: Arc<Entry<D>>,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum ReplicaEvent {
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatched {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The id of the most recent log known to have been successfully replicated on the target.
        matched: LogId,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
    /// An event from a replication stream requesting snapshot info.
    NeedsSnapshot {
        /// The ID of the target node from which the event was sent.
        target: NodeId,
        /// The response channel for delivering the snapshot data.
        tx: oneshot::Sender<Snapshot>,
    },
    /// Some critical error has taken place, and Raft needs to shutdown.
    Shutdown,
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatched {
                ref target,
                ref matched,
            } => {
                format!("UpdateMatched: target: {}, matched: {}", target, matched)
            }
            ReplicaEvent::RevertToFollower { ref target, ref term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
            ReplicaEvent::NeedsSnapshot { ref target, .. } => {
                format!("NeedsSnapshot: target: {}", target)
            }
            ReplicaEvent::Shutdown => "Shutdown".to_string(),
        }
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> ReplicationCore<D, R, N, S> {
    #[tracing::instrument(level = "trace", skip(self), fields(state = "pipeline"))]
    pub async fn pipeline_loop(&mut self) {
        loop {
            if self.progress.state != ProgressState::Pipeline {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // Ensure that our buffered data matches up with `next_index`. When transitioning to
            // pipeline mode, it is always possible that new data has been appended but skipped
            // this replication stream during the transition. In such cases, a single update from
            // storage will put this stream back on track.
            let index = next_buf_index.unwrap_or(self.last_log_index + 1);
            if self.progress.next_index != index {
                self.frontload_outbound_buffer(self.progress.next_index, index).await;
                if self.progress.state != ProgressState::Pipeline {
                    return;
                }
                self.send_append_entries().await;
                continue;
            }

            if next_buf_index.is_some() {
                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.progress.state = ProgressState::Shutdown,
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer due to transition from probing.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        if start >= stop {
            return;
        }
        let entries = match self.storage.get_log_entries(start..stop).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error while frontloading outbound buffer");
                let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                self.progress.state = ProgressState::Shutdown;
                return;
            }
        };

        // A short read means the range has been compacted away under a snapshot.
        if entries.len() < (stop - start) as usize {
            self.progress.state = ProgressState::Snapshotting;
            return;
        }

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "probe"))]
    pub async fn probe_loop(&mut self) {
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.progress.state != ProgressState::Probe {
                return;
            }

            // If the entries the follower needs have been compacted away, switch to snapshotting.
            let log_state = match self.storage.get_log_state().await {
                Ok(state) => state,
                Err(err) => {
                    tracing::error!(error=%err, "error fetching log state from storage");
                    let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                    self.progress.state = ProgressState::Shutdown;
                    return;
                }
            };
            if self.progress.next_index < log_state.first_log_index {
                self.progress.state = ProgressState::Snapshotting;
                return;
            }

            // All caught up: run at line rate.
            if self.progress.next_index > self.last_log_index {
                self.progress.state = ProgressState::Pipeline;
                return;
            }

            self.prep_outbound_buffer_from_storage().await;
            if self.progress.state != ProgressState::Probe {
                return;
            }
            self.send_append_entries().await;
            if self.progress.state != ProgressState::Probe {
                return;
            }

            // Pace fruitless probes at the heartbeat interval; a success above has already
            // promoted the stream to pipeline and returned.
            tokio::select! {
                _ = self.heartbeat.tick() => {},

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.progress.state = ProgressState::Shutdown,
                    }
                }
            }
        }
    }

    /// Prep the outbound buffer with the next payload of entries to append.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        // If the send buffer is empty, we need to fill it.
        if self.outbound_buffer.is_empty() {
            let start = self.progress.next_index;
            let stop = std::cmp::min(start + self.max_payload_entries as u64, self.last_log_index + 1);
            if start >= stop {
                return;
            }

            let entries = match self.storage.get_log_entries(start..stop).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error=%err, "error fetching logs from storage");
                    let _ = self.raft_core_tx.send((ReplicaEvent::Shutdown, tracing::debug_span!("CH")));
                    self.progress.state = ProgressState::Shutdown;
                    return;
                }
            };

            // A short read means the range has been compacted away under a snapshot.
            if entries.len() < (stop - start) as usize {
                self.progress.state = ProgressState::Snapshotting;
                return;
            }

            self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Snapshotting specific state.
struct SnapshottingState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// An exclusive handle to the replication core.
    replication_core: &'a mut ReplicationCore<D, R, N, S>,
    snapshot: Option<Snapshot>,
    snapshot_fetch_rx: Option<oneshot::Receiver<Snapshot>>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> SnapshottingState<'a, D, R, N, S> {
    /// Create a new instance.
    pub fn new(replication_core: &'a mut ReplicationCore<D, R, N, S>) -> Self {
        Self {
            replication_core,
            snapshot: None,
            snapshot_fetch_rx: None,
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    pub async fn run(mut self) {
        self.replication_core.replication_buffer.clear();
        self.replication_core.outbound_buffer.clear();

        loop {
            if self.replication_core.progress.state != ProgressState::Snapshotting {
                return;
            }

            // If we don't have any of the components we need, fetch the current snapshot.
            if self.snapshot.is_none() && self.snapshot_fetch_rx.is_none() {
                let (tx, rx) = oneshot::channel();
                let _ = self.replication_core.raft_core_tx.send((
                    ReplicaEvent::NeedsSnapshot {
                        target: self.replication_core.target,
                        tx,
                    },
                    tracing::debug_span!("CH"),
                ));
                self.snapshot_fetch_rx = Some(rx);
            }

            // If we are waiting for a snapshot response from the storage layer, then wait for
            // it and send heartbeats in the meantime.
            if let Some(snapshot_fetch_rx) = self.snapshot_fetch_rx.take() {
                self.wait_for_snapshot(snapshot_fetch_rx).await;
                continue;
            }

            // If we have a snapshot to work with, then send it.
            if let Some(snapshot) = self.snapshot.take() {
                self.send_snapshot(snapshot).await;
            }
        }
    }

    /// Wait for a response from the storage layer for the current snapshot.
    ///
    /// If an error comes up during processing, this routine should simply be called again after
    /// issuing a new request to the storage layer.
    #[tracing::instrument(level = "trace", skip(self, rx))]
    async fn wait_for_snapshot(&mut self, mut rx: oneshot::Receiver<Snapshot>) {
        loop {
            tokio::select! {
                _ = self.replication_core.heartbeat.tick() => self.replication_core.send_heartbeat().await,

                event_span = self.replication_core.repl_rx.recv() =>  {
                    match event_span {

                        Some((event, span)) => self.replication_core.drain_raft_rx(event, span),
                        None => {
                            self.replication_core.progress.state = ProgressState::Shutdown;
                            return;
                        }
                    }
                },

                res = &mut rx => {
                    match res {
                        Ok(snapshot) => {
                            self.snapshot = Some(snapshot);
                            return;
                        }
                        Err(_) => {
                            // The leader had no snapshot ready and has kicked off a compaction;
                            // wait out a heartbeat and re-request.
                            self.replication_core.heartbeat.tick().await;
                            self.replication_core.send_heartbeat().await;
                            return;
                        }
                    }
                },
            }
        }
    }

    /// Transfer the snapshot to the target in a single InstallSnapshot RPC.
    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(snapshot=%snapshot.meta.last_log_id))]
    async fn send_snapshot(&mut self, snapshot: Snapshot) {
        let req = InstallSnapshotRequest {
            term: self.replication_core.term,
            leader_id: self.replication_core.id,
            meta: snapshot.meta.clone(),
            data: snapshot.data.as_ref().clone(),
        };
        tracing::debug!(snapshot_size = req.data.len(), "sending snapshot");

        let res = timeout(
            self.replication_core.install_snapshot_timeout,
            self.replication_core.network.send_install_snapshot(self.replication_core.target, req),
        )
        .await;

        let res = match res {
            Ok(outer_res) => match outer_res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                    // Keep the snapshot for a retry after the next heartbeat.
                    self.snapshot = Some(snapshot);
                    self.replication_core.heartbeat.tick().await;
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                self.snapshot = Some(snapshot);
                self.replication_core.heartbeat.tick().await;
                return;
            }
        };
        self.replication_core.progress.recent_recv = true;

        // Handle response conditions.
        if res.term > self.replication_core.term {
            let _ = self.replication_core.raft_core_tx.send((
                ReplicaEvent::RevertToFollower {
                    target: self.replication_core.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.replication_core.progress.state = ProgressState::Shutdown;
            return;
        }

        // The snapshot is installed: the follower now matches the snapshot boundary, and the
        // stream drops back to probing from there.
        self.replication_core.progress.matched = snapshot.meta.last_log_id;
        self.replication_core.progress.next_index = snapshot.meta.last_log_id.index + 1;
        self.replication_core.progress.state = ProgressState::Probe;
        let _ = self.replication_core.raft_core_tx.send((
            ReplicaEvent::UpdateMatched {
                target: self.replication_core.target,
                matched: self.replication_core.progress.matched,
            },
            tracing::debug_span!("CH"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_new_probes_from_end_of_log() {
        let progress = Progress::new(10);
        assert_eq!(progress.state, ProgressState::Probe);
        assert_eq!(progress.next_index, 11);
        assert_eq!(progress.matched, LogId::new(0, 0));
        assert!(!progress.recent_recv);
    }

    #[test]
    fn test_progress_success_promotes_probe_to_pipeline() {
        let mut progress = Progress::new(10);
        progress.handle_success(LogId::new(2, 10));
        assert_eq!(progress.state, ProgressState::Pipeline);
        assert_eq!(progress.matched, LogId::new(2, 10));
        assert_eq!(progress.next_index, 11);
    }

    #[test]
    fn test_progress_success_never_regresses_matched() {
        let mut progress = Progress::new(10);
        progress.handle_success(LogId::new(2, 10));
        progress.handle_success(LogId::new(2, 4));
        assert_eq!(progress.matched, LogId::new(2, 10));
        assert_eq!(progress.next_index, 11);
    }

    #[test]
    fn test_progress_rejection_steps_back_one() {
        let mut progress = Progress::new(10);
        progress.handle_rejection(10);
        assert_eq!(progress.state, ProgressState::Probe);
        assert_eq!(progress.next_index, 10);
    }

    #[test]
    fn test_progress_rejection_caps_at_follower_end_of_log() {
        let mut progress = Progress::new(100);
        progress.handle_rejection(3);
        assert_eq!(progress.next_index, 4);
    }

    #[test]
    fn test_progress_rejection_never_drops_below_matched() {
        let mut progress = Progress::new(10);
        progress.handle_success(LogId::new(1, 8));
        progress.state = ProgressState::Probe;
        progress.handle_rejection(2);
        assert_eq!(progress.next_index, 9);
    }

    #[test]
    fn test_progress_rejection_floors_at_one() {
        let mut progress = Progress::new(0);
        progress.handle_rejection(0);
        assert_eq!(progress.next_index, 1);
    }
}
