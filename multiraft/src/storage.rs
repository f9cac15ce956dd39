//! The storage interface and data types.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::LogEntry;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// A record holding the durable election state of a single group.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ElectionState {
    /// The last term observed by this group.
    pub current_term: Term,
    /// The id of the node voted for in `current_term`, if any.
    pub voted_for: Option<NodeId>,
}

/// A batch of durable writes covering every dirty group.
///
/// Produced by the event loop and consumed by the write task; one request is
/// in flight at a time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    /// The per-group payloads of this batch.
    pub groups: BTreeMap<GroupId, GroupWriteRequest>,
}

impl WriteRequest {
    /// Check if this batch carries no work at all.
    pub fn is_empty(&self) -> bool {
        self.groups.values().all(|g| g.election_state.is_none() && g.entries.is_empty())
    }
}

/// The durable writes requested for a single group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupWriteRequest {
    /// The election state to persist, if it has advanced beyond the
    /// previously persisted record.
    pub election_state: Option<ElectionState>,
    /// Log entries to persist, in append order.
    pub entries: Vec<LogEntry>,
}

/// The storage layer's acknowledgement of a [`WriteRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteResponse {
    /// The per-group acknowledgements of this batch.
    pub groups: BTreeMap<GroupId, GroupWriteResponse>,
}

/// The storage layer's acknowledgement for a single group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupWriteResponse {
    /// The election state which is now durable, if the request included one.
    pub election_state: Option<ElectionState>,
    /// The index of the last entry persisted by this batch, or `None` if the
    /// batch carried no entries for this group.
    pub last_index: Option<LogIndex>,
    /// The term of the last entry persisted by this batch.
    pub last_term: Term,
    /// The entries which were persisted, so the caller can broadcast them.
    pub entries: Vec<LogEntry>,
}

/// A trait defining the interface to a durable storage system.
///
/// Implementations must apply each group's portion of a batch atomically and
/// preserve per-group entry order: entries are handed over in append order,
/// and an election-state update for term T must be durable no later than any
/// entry written at term >= T for the same group.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Durably record the given batch, returning what was persisted per group.
    ///
    /// Errors returned from this method are fatal and will cause the engine
    /// to shut down.
    async fn write(&self, batch: WriteRequest) -> Result<WriteResponse>;

    /// Get a series of log entries for `group`, covering `[lo, hi]` inclusive,
    /// ordered by index.
    ///
    /// Errors returned from this method are fatal and will cause the engine
    /// to shut down.
    async fn get_log_entries(&self, group: GroupId, lo: LogIndex, hi: LogIndex) -> Result<Vec<LogEntry>>;
}
