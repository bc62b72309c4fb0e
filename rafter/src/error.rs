//! Error types exposed by this crate.

use crate::membership::Role;
use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    ///
    /// Storage errors are fatal: the node which encounters one transitions to shutdown in order
    /// to preserve data safety, and every pending client operation is failed.
    #[error("{0}")]
    RaftStorage(#[source] anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    ///
    /// Network errors are non-fatal; replication retries on its next tick.
    #[error("{0}")]
    RaftNetwork(#[source] anyhow::Error),
    /// The node received a snapshot older than what it has already applied.
    #[error("snapshot is no newer than this node's last applied log")]
    SnapshotStale,
    /// The Raft node is shutting down.
    #[error("raft stopped")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D: AppData> {
    /// An error related to the processing of the client request.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client request must be forwarded to the cluster leader, if known.
    ///
    /// This is also returned while a leadership transfer is in progress, during which the node
    /// refuses new writes even though it is still nominally the leader.
    #[error("this node is not the Raft leader")]
    ForwardToLeader(D, Option<NodeId>),
}

/// An error related to a membership change or a leadership transfer.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// An error related to the processing of the request.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested change would have no effect.
    ///
    /// This could be a request to assign a server the role it already holds, or to add a server
    /// which is already a cluster member.
    #[error("the requested config change would have no effect")]
    Noop,
    /// The given server ID is zero or refers to the local node where that is not allowed.
    #[error("invalid server id for membership change")]
    InvalidServerId,
    /// The server being added is already a member of the cluster.
    #[error("server is already a cluster member")]
    ServerExists,
    /// The given server is not a member of the cluster.
    #[error("no cluster member with the given id")]
    UnknownServer,
    /// The target role is invalid for the given server.
    #[error("invalid role {role:?} for server {id}")]
    InvalidRole { id: NodeId, role: Role },
    /// A membership change is already in flight or not yet committed.
    #[error("another config change is in progress or not yet committed")]
    ChangeInProgress,
    /// The promotee failed to catch up with the log within the allowed number of rounds.
    #[error("server could not catch up with the leader log in time")]
    CatchUpTimeout,
    /// The node is not the Raft leader.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
}

/// The set of errors which may take place when requesting to propose a config change or a
/// leadership transfer.
#[derive(Debug, derive_more::From, thiserror::Error)]
pub enum ResponseError {
    #[error("{0}")]
    ChangeConfig(ChangeConfigError),
    #[error("{0}")]
    Raft(RaftError),
}

/// Errors produced by storage implementations.
///
/// Implementations of `RaftStorage` transport these through `anyhow::Error`; the distinct kinds
/// matter mostly at startup (where `Malformed`/`Corrupt` abort the load) and at shutdown (where
/// pending requests drain as `Canceled`).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The underlying durable storage failed.
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A file carries an unsupported format version.
    #[error("unsupported on-disk format: {0}")]
    Malformed(String),
    /// A checksum mismatch or an implausible length was found.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    /// The requested server, entry or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was dropped because the store is shutting down.
    #[error("request canceled by shutdown")]
    Canceled,
    /// The operation was submitted after the store was closed or errored.
    #[error("store is shut down")]
    Shutdown,
}

/// Error variants related to configuration validation.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The election timeout window is inverted, or does not dominate the heartbeat interval.
    #[error("election timeout min & max are invalid: min must be less than max and well above the heartbeat interval")]
    InvalidElectionTimeoutMinMax,
    /// The given value for max_payload_entries is too small.
    #[error("max_payload_entries must be greater than 0")]
    MaxPayloadEntriesTooSmall,
    /// The given value for max_catch_up_rounds is too small.
    #[error("max_catch_up_rounds must be greater than 0")]
    MaxCatchUpRoundsTooSmall,
}
