//! An in-memory storage backend for `multiraft`, for demo and testing.

use std::collections::BTreeMap;

use anyhow::Result;
use multiraft::async_trait::async_trait;
use multiraft::storage::GroupWriteResponse;
use multiraft::storage::WriteRequest;
use multiraft::storage::WriteResponse;
use multiraft::ElectionState;
use multiraft::GroupId;
use multiraft::LogEntry;
use multiraft::LogIndex;
use multiraft::Storage;
use tokio::sync::watch;
use tokio::sync::RwLock;


/// An in-memory `Storage` implementation.
///
/// Each group's portion of a batch is applied atomically while the write
/// locks are held; entries land at their own index, so replaying a batch is
/// idempotent.
///
/// For exercising the engine's durability gating, writes can be paused with
/// [`block_writes`](MemStore::block_writes): `write` calls made while the
/// gate is closed park until [`release_writes`](MemStore::release_writes).
pub struct MemStore {
    /// Per-group logs, keyed by entry index.
    log: RwLock<BTreeMap<GroupId, BTreeMap<LogIndex, LogEntry>>>,
    /// Per-group durable election state.
    election: RwLock<BTreeMap<GroupId, ElectionState>>,
    gate: watch::Sender<bool>,
}

impl MemStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            log: RwLock::new(BTreeMap::new()),
            election: RwLock::new(BTreeMap::new()),
            gate,
        }
    }

    /// Park subsequent `write` calls until [`release_writes`](Self::release_writes).
    pub fn block_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Let parked and future `write` calls proceed.
    pub fn release_writes(&self) {
        self.gate.send_replace(false);
    }

    async fn wait_writable(&self) {
        let mut gate = self.gate.subscribe();
        while *gate.borrow() {
            if gate.changed().await.is_err() {
                return;
            }
        }
    }

    /// The index of the last entry stored for `group`, if any.
    pub async fn last_index(&self, group: GroupId) -> Option<LogIndex> {
        self.log.read().await.get(&group).and_then(|log| log.keys().next_back().copied())
    }

    /// All entries stored for `group`, in index order.
    pub async fn log_entries(&self, group: GroupId) -> Vec<LogEntry> {
        self.log
            .read()
            .await
            .get(&group)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The durable election state for `group`, if any.
    pub async fn election_state(&self, group: GroupId) -> Option<ElectionState> {
        self.election.read().await.get(&group).cloned()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemStore {
    #[tracing::instrument(level = "trace", skip(self, batch))]
    async fn write(&self, batch: WriteRequest) -> Result<WriteResponse> {
        self.wait_writable().await;
        let mut log = self.log.write().await;
        let mut election = self.election.write().await;
        let mut response = WriteResponse::default();
        for (group_id, request) in batch.groups {
            let mut persisted = GroupWriteResponse::default();
            if let Some(election_state) = request.election_state {
                election.insert(group_id, election_state.clone());
                persisted.election_state = Some(election_state);
            }
            if let Some(last) = request.entries.last() {
                persisted.last_index = Some(last.index);
                persisted.last_term = last.term;
                let group_log = log.entry(group_id).or_default();
                for entry in &request.entries {
                    group_log.insert(entry.index, entry.clone());
                }
                persisted.entries = request.entries;
            }
            response.groups.insert(group_id, persisted);
        }
        Ok(response)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_log_entries(&self, group: GroupId, lo: LogIndex, hi: LogIndex) -> Result<Vec<LogEntry>> {
        if lo > hi {
            tracing::error!("invalid request, lo > hi");
            return Ok(vec![]);
        }
        let log = self.log.read().await;
        Ok(log
            .get(&group)
            .map(|entries| entries.range(lo..=hi).map(|(_, entry)| entry.clone()).collect())
            .unwrap_or_default())
    }
}
