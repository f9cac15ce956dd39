//! The asynchronous write pipeline.
//!
//! The event loop prepares one batch covering every dirty group; this task
//! consumes it, hands it to the storage layer, and replies with the
//! acknowledgement. Keeping the fsync on a separate task lets the loop keep
//! advancing in-memory state while a write is in flight.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::core::MultiRaftCore;
use crate::error::MultiRaftResult;
use crate::network::Transport;
use crate::raft::LogEntry;
use crate::storage::Storage;
use crate::storage::WriteRequest;
use crate::storage::WriteResponse;
use crate::LogIndex;
use crate::Term;

/// Handles to a running write task.
///
/// `tx` has capacity 1: the loop `reserve()`s a slot only while the dirty
/// set is non-empty, which is the write-ready handshake.
pub(crate) struct WriteTask {
    pub(crate) tx: mpsc::Sender<WriteRequest>,
    pub(crate) rx: mpsc::Receiver<anyhow::Result<WriteResponse>>,
    pub(crate) stop: Option<oneshot::Sender<()>>,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl WriteTask {
    pub(crate) fn spawn<S: Storage>(storage: Arc<S>) -> Self {
        let (tx, rx_in) = mpsc::channel(1);
        let (tx_out, rx) = mpsc::channel(1);
        let (tx_stop, rx_stop) = oneshot::channel();
        let handle = tokio::spawn(run(storage, rx_in, tx_out, rx_stop).instrument(tracing::debug_span!("write_task")));
        Self {
            tx,
            rx,
            stop: Some(tx_stop),
            handle: Some(handle),
        }
    }

    /// Signal the task to stop and wait for any in-flight write to finish.
    pub(crate) async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<S: Storage, T: Transport> MultiRaftCore<S, T> {
    /// Fold one write acknowledgement back into group state: advance the
    /// persisted mirrors, broadcast now-durable entries if leading, advance
    /// the commit position, release pending calls, and recompute dirtiness.
    #[tracing::instrument(level = "trace", skip(self, response))]
    pub(super) async fn handle_write_response(&mut self, response: WriteResponse) -> MultiRaftResult<()> {
        for (group_id, persisted) in response.groups {
            if !self.groups.contains_key(&group_id) {
                self.strict_error(format!("write response for unknown group {}", group_id));
                continue;
            }
            let mut broadcast: Option<(Vec<LogEntry>, LogIndex, Term)> = None;
            let mut ordering_violation = None;
            let is_leader;
            let leader_commit_index;
            {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    continue;
                };
                if let Some(election_state) = persisted.election_state {
                    group.persisted_election_state = Some(election_state);
                }
                if let Some(last_index) = persisted.last_index {
                    if last_index < group.persisted_last_index {
                        ordering_violation = Some(format!(
                            "group {} persisted log index regressed from {} to {}",
                            group_id, group.persisted_last_index, last_index
                        ));
                    } else {
                        tracing::trace!(group = group_id, last_index, "updating persisted log position");
                        let prev = (group.persisted_last_index, group.persisted_last_term);
                        group.persisted_last_index = last_index;
                        group.persisted_last_term = persisted.last_term;
                        if group.role.is_leader() {
                            // The leader's own durability counts toward the quorum.
                            group.match_index.insert(self.id, last_index);
                            broadcast = Some((persisted.entries, prev.0, prev.1));
                        }
                    }
                }
                is_leader = group.role.is_leader();
                leader_commit_index = group.leader_commit_index;
            }
            if let Some(msg) = ordering_violation {
                self.strict_error(msg);
            }
            if let Some((entries, prev_log_index, prev_log_term)) = broadcast {
                self.broadcast_entries(group_id, &entries, prev_log_index, prev_log_term);
            }
            // A leader may now hold a quorum for its own entries; a node
            // that is catching up may commit newly-persisted entries the
            // leader already considers committed.
            let commit_input = if is_leader {
                self.groups.get(&group_id).map(|g| g.find_quorum_index()).unwrap_or(0)
            } else {
                leader_commit_index
            };
            self.commit_entries(group_id, commit_input).await?;
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.resolve_pending_calls();
            }
            self.update_dirty_status(group_id);
        }
        Ok(())
    }
}

async fn run<S: Storage>(
    storage: Arc<S>,
    mut rx_in: mpsc::Receiver<WriteRequest>,
    tx_out: mpsc::Sender<anyhow::Result<WriteResponse>>,
    mut rx_stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut rx_stop => {
                tracing::debug!("write task stopping");
                return;
            }
            maybe_request = rx_in.recv() => {
                let Some(request) = maybe_request else {
                    return;
                };
                if request.is_empty() {
                    continue;
                }
                tracing::trace!(groups = request.groups.len(), "persisting write batch");
                let res = storage.write(request).await;
                if tx_out.send(res).await.is_err() {
                    return;
                }
            }
        }
    }
}
