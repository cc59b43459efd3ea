//! Error types exposed by this crate.

use crate::raft_types::SnapshotSegmentId;
use crate::AppData;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
    /// The node received an out-of-order install-snapshot segment.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// An IO error from tokio.
    #[error(transparent)]
    IO(#[from] tokio::io::Error),
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError<D: AppData> {
    /// An error related to the processing of the client write request.
    #[error(transparent)]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error("the client write request must be forwarded to the cluster leader: {1:?}")]
    ForwardToLeader(D, Option<NodeId>),
    /// Leadership was lost before the pending entry committed.
    ///
    /// The entry was never committed by this node. The client may retry against the hinted
    /// leader, but commands must be idempotent as a retried command may be executed twice if
    /// the original entry does eventually commit under a new leader.
    #[error("leadership was lost before the request committed, last known leader: {leader_hint:?}")]
    LeadershipLost { leader_hint: Option<NodeId> },
    /// The request's deadline elapsed before the entry was committed and applied.
    ///
    /// The entry may still commit and apply; the client must handle retries idempotently.
    #[error("the client write request timed out, the entry may still commit")]
    Timeout,
}

/// Error variants related to configuration changes.
#[derive(Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error(transparent)]
    RaftError(#[from] RaftError),
    /// The cluster is already undergoing a configuration change.
    #[error("the cluster is already undergoing a configuration change")]
    ConfigChangeInProgress,
    /// The given config would leave the cluster in an inoperable state.
    ///
    /// This error will be returned if the full set of changes, once fully applied, would leave
    /// the cluster with less than two members.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The node the config change was submitted to is not the leader of the cluster.
    #[error("this node is not the Raft leader, last known leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),
    /// The target node was refused membership by the cluster's membership authorizer.
    #[error("the target node was refused cluster membership by the membership authorizer")]
    NotAuthorized,
    /// The proposed config changes would make no difference to the current config.
    #[error("the proposed config change would make no difference to the current config")]
    Noop,
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error(transparent)]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the node's current state")]
    NotAllowed,
}

/// The error returned for admin commands routed through the Raft node.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error(transparent)]
    ChangeConfig(#[from] ChangeConfigError),
}

impl From<RaftError> for ResponseError {
    fn from(src: RaftError) -> Self {
        ResponseError::ChangeConfig(ChangeConfigError::RaftError(src))
    }
}
