//! Error types exposed by this crate.

use crate::GroupId;
use crate::NodeId;

/// A result type where the error variant is always a `MultiRaftError`.
pub type MultiRaftResult<T> = std::result::Result<T, MultiRaftError>;

/// Error variants related to the internals of the engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MultiRaftError {
    /// An error surfaced while validating the engine's configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error which has come from the `Storage` layer.
    #[error("{0}")]
    Storage(anyhow::Error),

    /// An error which has come from the `Transport` layer.
    #[error("{0}")]
    Transport(anyhow::Error),

    /// An RPC was addressed to a group which is not hosted on this node.
    #[error("unknown group {0}")]
    GroupNotFound(GroupId),

    /// The engine is shutting down.
    #[error("the multiraft engine is shutting down")]
    ShuttingDown,
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A node id of zero is reserved as "unset" and may not be used.
    #[error("a node id of zero is reserved as unset")]
    InvalidNodeId,

    /// Election timeouts must both be non-zero, with min <= max.
    #[error("election timeouts must both be non-zero, with min <= max")]
    InvalidElectionTimeout,
}

/// The set of errors which may take place when creating a consensus group.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateGroupError {
    /// A group with the given id already exists on this node.
    #[error("group {0} already exists")]
    GroupExists(GroupId),

    /// One of the initial members carried the reserved zero node id.
    #[error("a node id of zero is reserved as unset")]
    InvalidNodeId,

    /// Dialing one of the group's members failed.
    #[error("failed to dial node {node}: {source}")]
    TransportDialFailed {
        node: NodeId,
        #[source]
        source: anyhow::Error,
    },

    /// An internal engine error.
    #[error("{0}")]
    Raft(#[from] MultiRaftError),
}

/// The set of errors which may take place when submitting a command or a
/// membership change to a group.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// This node is not the leader of the target group.
    #[error("this node is not the leader of group {0}")]
    NotLeader(GroupId),

    /// The target group is not hosted on this node.
    #[error("unknown group {0}")]
    GroupNotFound(GroupId),

    /// An internal engine error.
    #[error("{0}")]
    Raft(#[from] MultiRaftError),
}
