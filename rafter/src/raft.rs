//! Public Raft interface and data types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeConfigError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ResponseError;
use crate::membership::Configuration;
use crate::membership::Role;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type implements the full Raft spec, and is the interface to a running Raft node.
/// Applications building on top of Raft will use this to spawn a Raft task and interact with
/// the spawned task.
///
/// For more information on the Raft protocol, see
/// [the specification here](https://raft.github.io/raft.pdf) (**pdf warning**).
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft node
/// is shutting down (potentially for data safety reasons due to a storage error), and the `shutdown`
/// method should be called on this type to await the shutdown of the node. If the parent
/// application needs to shutdown the Raft node for any reason, calling `shutdown` will do the trick.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should be
    /// persisted in a well known location, probably alongside the Raft log and the application's
    /// state machine. This ensures that restarts of the node will yield the same ID every time.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs to
    /// peer nodes within the cluster. See the docs on the `RaftNetwork` trait for more details.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data storage.
    /// See the docs on the `RaftStorage` trait for more details.
    #[tracing::instrument(level="trace", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// The leader sends the full snapshot in a single RPC to bring a new node or a slow node
    /// up-to-speed with the leader (§7). The response is an AppendEntries result whose
    /// `last_log_index` acknowledges the snapshot boundary.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::InstallSnapshot { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a TimeoutNow RPC to this Raft node.
    ///
    /// A leader sends this to its chosen successor at the end of a leadership transfer; an
    /// up-to-date voter receiving it starts an election immediately, ignoring its timer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn timeout_now(&self, rpc: TimeoutNowRequest) -> Result<(), RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        self.inner
            .tx_api
            .send((RaftMsg::TimeoutNow { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date. This method is perfect for making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine will
    /// be returned as the response from this method.
    ///
    /// Our goal for Raft is to implement linearizable semantics. If the leader crashes after committing
    /// a log entry but before responding to the client, the client may retry the command with a new
    /// leader, causing it to be executed a second time. As such, clients should assign unique serial
    /// numbers to every command. Then, the state machine should track the latest serial number
    /// processed for each client, along with the associated response. If it receives a command whose
    /// serial number has already been executed, it responds immediately without reexecuting the
    /// request (§8). The `RaftStorage::apply_to_state_machine` method is the perfect place
    /// to implement this.
    ///
    /// These are application specific requirements, and must be implemented by the application which is
    /// being built on top of Raft.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(
        &self,
        rpc: ClientWriteRequest<D>,
    ) -> Result<ClientWriteResponse<R>, ClientWriteError<D>> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();

        let res = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { rpc, tx }, span));

        if let Err(e) = res {
            tracing::error!("error when Raft::client_write: send to tx_api: {}", e);
            return Err(ClientWriteError::RaftError(RaftError::ShuttingDown));
        }

        let res = rx.await;
        match res {
            Ok(v) => {
                if let Err(ref e) = v {
                    tracing::error!("error Raft::client_write: {:?}", e);
                }
                v
            }
            Err(e) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", e);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Append a barrier entry to the log, resolving once it has been committed and applied.
    ///
    /// A barrier carries no payload; its only purpose is to flush the leader's pipeline. The
    /// returned index is the barrier's position in the log, and every entry at or below it is
    /// guaranteed to have been applied to the state machine when this resolves.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn barrier(&self) -> Result<u64, ResponseError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::Barrier { tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        self.recv_change_response(rx).await
    }

    /// Add a new server to the cluster as a spare (§6).
    ///
    /// The new server is registered in the configuration but receives neither votes nor log
    /// entries until it is assigned another role. This resolves once the configuration entry
    /// has been committed to the cluster.
    ///
    /// If this Raft node is not the cluster leader, then this call will fail.
    #[tracing::instrument(level = "debug", skip(self, address), fields(target=id))]
    pub async fn add_server(&self, id: NodeId, address: impl Into<String>) -> Result<u64, ResponseError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((
                RaftMsg::AddServer {
                    id,
                    address: address.into(),
                    tx,
                },
                span,
            ))
            .map_err(|_| RaftError::ShuttingDown)?;

        self.recv_change_response(rx).await
    }

    /// Assign a new role to a cluster member (§6).
    ///
    /// Promoting a server to voter first drives catch-up rounds: the promotion is only appended
    /// to the log once the server has replicated the leader's log to within one election
    /// timeout. Demotions take effect immediately. This resolves once the configuration entry
    /// has been committed.
    ///
    /// If this Raft node is not the cluster leader, then this call will fail.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn assign_role(&self, id: NodeId, role: Role) -> Result<u64, ResponseError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AssignRole { id, role, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        self.recv_change_response(rx).await
    }

    /// Remove a server from the cluster (§6).
    ///
    /// This resolves once the configuration entry has been committed. A leader may remove
    /// itself; it steps down once the entry commits.
    #[tracing::instrument(level = "debug", skip(self), fields(target=id))]
    pub async fn remove_server(&self, id: NodeId) -> Result<u64, ResponseError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RemoveServer { id, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        self.recv_change_response(rx).await
    }

    /// Transfer leadership to another voter.
    ///
    /// If no target is given, the most caught-up voter is chosen. The transfer resolves once
    /// the TimeoutNow RPC has been dispatched to the target; client writes submitted while the
    /// transfer is pending fail as not-leader. A transfer which cannot bring its target
    /// up-to-date within one election timeout is abandoned and leadership resumes as normal.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn transfer_leadership(&self, target: Option<NodeId>) -> Result<u64, ResponseError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::TransferLeadership { target, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        self.recv_change_response(rx).await
    }

    async fn recv_change_response(
        &self,
        rx: oneshot::Receiver<Result<u64, ResponseError>>,
    ) -> Result<u64, ResponseError> {
        let recv_res = rx.await;
        match recv_res {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("recv rx error: {}", e);
                Err(ChangeConfigError::RaftError(RaftError::ShuttingDown).into())
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use rafter::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log 3").await?;
    ///
    /// // wait for raft node's current leader to become 3:
    /// r.wait(Some(timeout)).current_leader(3, "leader 3").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(Some(timeout)).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ClientWriteResponseTx<D, R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError<D>>>;
pub(crate) type ResponseTx = oneshot::Sender<Result<u64, ResponseError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    TimeoutNow {
        rpc: TimeoutNowRequest,
        tx: oneshot::Sender<Result<(), RaftError>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<D, R>,
    },
    Barrier {
        tx: ResponseTx,
    },
    AddServer {
        id: NodeId,
        address: String,
        tx: ResponseTx,
    },
    AssignRole {
        id: NodeId,
        role: Role,
        tx: ResponseTx,
    },
    RemoveServer {
        id: NodeId,
        tx: ResponseTx,
    },
    TransferLeadership {
        target: Option<NodeId>,
        tx: ResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`, also used to acknowledge snapshot installation.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// The prev log index the request was rejected on, 0 if the request was accepted.
    ///
    /// Receivers must apply the term rule before interpreting this field: a response carrying a
    /// newer term deposes the leader regardless of the value here.
    pub rejected: u64,
    /// The responding node's last log index, which the leader uses to cap its probe backtracking.
    pub last_log_index: u64,
}

impl AppendEntriesResponse {
    /// Whether the request was accepted.
    pub fn is_success(&self) -> bool {
        self.rejected == 0
    }
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[Entry<D>] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// A normal log entry carrying an application command.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A content-less entry used to flush the leader's pipeline; the first entry of every term.
    Barrier,
    /// A config change log entry.
    ConfigChange(EntryConfigChange),
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Normal(_n) => "normal".to_string(),
            EntryPayload::Barrier => "barrier".to_string(),
            EntryPayload::ConfigChange(c) => {
                format!("config-change: {:?}", c.membership)
            }
        }
    }
}

/// A normal log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A log entry holding a config change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// Details on the cluster's membership configuration.
    pub membership: Configuration,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry (§5.4).
    pub last_log_term: u64,
    /// Set when this election was started by a TimeoutNow from the current leader.
    ///
    /// Receivers normally refuse to vote while they believe a leader is alive; this flag
    /// overrides that check so a leadership transfer can depose a healthy leader.
    pub disrupt_leader: bool,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64, disrupt_leader: bool) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
            disrupt_leader,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to transfer a full snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// Metadata of the snapshot: last covered log id, membership and its index.
    pub meta: SnapshotMeta,

    /// The raw bytes of the snapshot.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={:?}, len={}",
            self.term,
            self.leader_id,
            self.meta,
            self.data.len(),
        )
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a leader to its chosen successor to finish a leadership transfer.
#[derive(Debug, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// The sending leader's current term.
    pub term: u64,
    /// The index of the leader's last log entry, for the target to sanity-check its own log.
    pub last_log_index: u64,
    /// The term of the leader's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for TimeoutNowRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
///
/// The entry of this payload will be appended to the Raft log and then applied to the Raft state
/// machine according to the Raft protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The application specific contents of this client request.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for ClientWriteRequest<D> {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Create a new client payload instance with a normal entry type.
    pub fn new(entry: D) -> Self {
        Self::new_base(EntryPayload::Normal(EntryNormal { data: entry }))
    }

    /// Create a new instance.
    pub(crate) fn new_base(entry: EntryPayload<D>) -> Self {
        Self { entry }
    }

    /// Generate a new payload holding a config change.
    pub(crate) fn new_config(membership: Configuration) -> Self {
        Self::new_base(EntryPayload::ConfigChange(EntryConfigChange { membership }))
    }

    /// Generate a new barrier payload.
    ///
    /// This is used by new leaders when first coming to power, and by the `barrier` client call.
    pub(crate) fn new_barrier() -> Self {
        Self::new_base(EntryPayload::Barrier)
    }
}

/// The response to a `ClientRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
