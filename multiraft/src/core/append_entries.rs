//! The replication subsystem: append receive and response paths, the commit
//! rule, and broadcast.

use crate::core::pending::PendingCall;
use crate::core::MultiRaftCore;
use crate::core::Role;
use crate::error::MultiRaftError;
use crate::error::MultiRaftResult;
use crate::event::Event;
use crate::network::Transport;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ChangeMembershipPayload;
use crate::raft::LogEntry;
use crate::raft::LogEntryKind;
use crate::raft::MembershipChange;
use crate::raft::MessageHeader;
use crate::raft::RaftReplyTx;
use crate::raft::RaftRequest;
use crate::raft::RaftResponse;
use crate::storage::Storage;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// What a leader owes a peer after processing its append response.
enum FollowUp {
    /// The peer's log is behind; re-send from `next_index`.
    CatchUp,
    /// The peer acked already-committed entries; send it the commit position.
    CommitRefresh,
}

impl<S: Storage, T: Transport> MultiRaftCore<S, T> {
    /// An RPC invoked by the group leader to replicate log entries (§5.3).
    ///
    /// From the Raft paper, receiver implementation:
    /// 1. Reply false if term < currentTerm (§5.1)
    /// 2. Reply false if the log doesn't contain an entry at prevLogIndex
    ///    whose term matches prevLogTerm (§5.3)
    /// 3. Append any new entries not already in the log
    /// 4. If leaderCommit > commitIndex, set commitIndex =
    ///    min(leaderCommit, last log index)
    ///
    /// A successful response is withheld until the appended entries are
    /// durable on this node.
    #[tracing::instrument(level = "trace", skip(self, req, tx), fields(group = req.group, leader = req.leader))]
    pub(super) async fn handle_append_entries(&mut self, req: AppendEntriesRequest, tx: RaftReplyTx) -> MultiRaftResult<()> {
        let group_id = req.group;
        let deadline = self.random_election_deadline();
        let leader_commit = req.leader_commit;
        {
            let Some(group) = self.groups.get_mut(&group_id) else {
                tracing::warn!(group = group_id, "append entries for unknown group");
                let _ = tx.send(Err(MultiRaftError::GroupNotFound(group_id)));
                return Ok(());
            };
            if req.term < group.election_state.current_term {
                tracing::debug!(
                    term = req.term,
                    current_term = group.election_state.current_term,
                    "rejecting append entries from a stale term"
                );
                let _ = tx.send(Ok(RaftResponse::AppendEntries(AppendEntriesResponse {
                    header: MessageHeader {
                        from: self.id,
                        to: req.header.from,
                    },
                    term: group.election_state.current_term,
                    success: false,
                })));
                return Ok(());
            }
            if req.term > group.election_state.current_term {
                group.election_state.current_term = req.term;
                group.election_state.voted_for = None;
                if group.role.is_leader() {
                    tracing::info!(term = req.term, "stepping down, observed a higher term");
                    group.role = Role::Follower;
                }
            }
            if group.role.is_candidate() {
                group.role = Role::Follower;
            }
            // Contact from a valid leader pushes out the election deadline.
            group.election_deadline = deadline;

            if req.prev_log_index > group.last_log_index {
                tracing::debug!(
                    prev_log_index = req.prev_log_index,
                    last_log_index = group.last_log_index,
                    "rejecting append entries, log is missing entries"
                );
                let _ = tx.send(Ok(RaftResponse::AppendEntries(AppendEntriesResponse {
                    header: MessageHeader {
                        from: self.id,
                        to: req.header.from,
                    },
                    term: group.election_state.current_term,
                    success: false,
                })));
                return Ok(());
            }

            group.pending_entries.extend(req.entries.iter().cloned());
            if let Some(last) = req.entries.last() {
                group.last_log_index = last.index;
                group.last_log_term = last.term;
            }
            let response = RaftResponse::AppendEntries(AppendEntriesResponse {
                header: MessageHeader {
                    from: self.id,
                    to: req.header.from,
                },
                term: group.election_state.current_term,
                success: true,
            });
            let gate_index = group.last_log_index;
            group.register_pending_call(PendingCall::new(tx, response, None, Some(gate_index)));
        }
        self.update_dirty_status(group_id);
        self.commit_entries(group_id, leader_commit).await
    }

    /// From the Raft paper: if successful, update nextIndex and matchIndex
    /// for the follower (§5.3); if AppendEntries fails because of log
    /// inconsistency, decrement nextIndex and retry (§5.3). The retry is a
    /// targeted re-send from `next_index`, fetched from storage.
    #[tracing::instrument(level = "trace", skip(self, req, resp), fields(group = req.group, from = req.header.to))]
    pub(super) async fn handle_append_entries_response(
        &mut self,
        req: AppendEntriesRequest,
        resp: AppendEntriesResponse,
    ) -> MultiRaftResult<()> {
        let group_id = req.group;
        let target = req.header.to;
        let deadline = self.random_election_deadline();
        let (quorum_index, follow_up) = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                tracing::warn!(group = group_id, "append entries response for unknown group");
                return Ok(());
            };
            if !group.role.is_leader() {
                tracing::trace!(group = group_id, "ignoring append entries response, no longer leader");
                return Ok(());
            }
            let mut follow_up = None;
            if resp.success {
                if let Some(last) = req.entries.last() {
                    group.next_index.insert(target, last.index + 1);
                    group.match_index.insert(target, last.index);
                    // The peer may have acked entries this node has already
                    // committed; no further broadcast is coming for those, so
                    // hand it the commit position directly.
                    if group.commit_index >= last.index {
                        follow_up = Some(FollowUp::CommitRefresh);
                    }
                }
            } else if resp.term > group.election_state.current_term {
                tracing::info!(group = group_id, term = resp.term, "stepping down, peer reported a higher term");
                group.election_state.current_term = resp.term;
                group.election_state.voted_for = None;
                group.role = Role::Follower;
                group.election_deadline = deadline;
                self.update_dirty_status(group_id);
                return Ok(());
            } else {
                let fallback = group.last_log_index + 1;
                let next = group.next_index.entry(target).or_insert(fallback);
                if *next > 1 {
                    *next -= 1;
                }
                follow_up = Some(FollowUp::CatchUp);
            }
            (group.find_quorum_index(), follow_up)
        };
        match follow_up {
            Some(FollowUp::CatchUp) => self.send_catch_up(group_id, target).await?,
            Some(FollowUp::CommitRefresh) => self.send_commit_refresh(group_id, target),
            None => {}
        }
        self.commit_entries(group_id, quorum_index).await
    }

    /// Re-send a lagging peer the durable entries from its `next_index`
    /// onward, with the preceding entry as the consistency point.
    async fn send_catch_up(&mut self, group_id: GroupId, target: NodeId) -> MultiRaftResult<()> {
        let (next, persisted_last) = {
            let Some(group) = self.groups.get(&group_id) else {
                return Ok(());
            };
            if !group.role.is_leader() {
                return Ok(());
            }
            let next = group.next_index.get(&target).copied().unwrap_or(group.persisted_last_index + 1);
            (next, group.persisted_last_index)
        };
        if next > persisted_last {
            return Ok(());
        }
        let entries = self
            .storage
            .get_log_entries(group_id, next, persisted_last)
            .await
            .map_err(MultiRaftError::Storage)?;
        let (prev_log_index, prev_log_term) = if next > 1 {
            let mut prev = self
                .storage
                .get_log_entries(group_id, next - 1, next - 1)
                .await
                .map_err(MultiRaftError::Storage)?;
            match prev.pop() {
                Some(entry) => (entry.index, entry.term),
                None => {
                    tracing::warn!(group = group_id, index = next - 1, "log has no entry at the catch-up consistency point");
                    return Ok(());
                }
            }
        } else {
            (0, 0)
        };
        let Some(group) = self.groups.get(&group_id) else {
            return Ok(());
        };
        tracing::debug!(group = group_id, peer = target, from = next, to = persisted_last, "sending catch-up entries");
        self.send_to_peer(
            target,
            RaftRequest::AppendEntries(AppendEntriesRequest {
                header: MessageHeader { from: self.id, to: target },
                group: group_id,
                term: group.election_state.current_term,
                leader: self.id,
                prev_log_index,
                prev_log_term,
                leader_commit: group.commit_index,
                entries,
            }),
        );
        Ok(())
    }

    /// Send one empty append carrying the current commit position to a peer
    /// whose acked entries are already committed here.
    fn send_commit_refresh(&self, group_id: GroupId, target: NodeId) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        if !group.role.is_leader() {
            return;
        }
        tracing::trace!(group = group_id, peer = target, commit = group.commit_index, "sending commit position refresh");
        self.send_to_peer(
            target,
            RaftRequest::AppendEntries(AppendEntriesRequest {
                header: MessageHeader { from: self.id, to: target },
                group: group_id,
                term: group.election_state.current_term,
                leader: self.id,
                prev_log_index: group.persisted_last_index,
                prev_log_term: group.persisted_last_term,
                leader_commit: group.commit_index,
                entries: Vec::new(),
            }),
        );
    }

    /// Advance the commit position toward `leader_commit_index` (on a
    /// follower, the position reported by the leader; on the leader, the
    /// quorum index), capped by what is durable locally. Never regresses.
    pub(super) async fn commit_entries(&mut self, group_id: GroupId, leader_commit_index: LogIndex) -> MultiRaftResult<()> {
        let (lo, target) = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return Ok(());
            };
            if leader_commit_index == group.commit_index {
                return Ok(());
            }
            if leader_commit_index < group.commit_index {
                // The commit index cannot actually move backwards, but a
                // newly-elected leader might report stale positions for a
                // short time, so just ignore them.
                tracing::trace!(
                    group = group_id,
                    incoming = leader_commit_index,
                    commit_index = group.commit_index,
                    "ignoring commit position behind the existing commit"
                );
                return Ok(());
            }
            group.leader_commit_index = group.leader_commit_index.max(leader_commit_index);
            // If we are not caught up with the leader, just commit as far as
            // we can; the rest commits as persistence catches up.
            let target = leader_commit_index.min(group.persisted_last_index);
            if target <= group.commit_index {
                return Ok(());
            }
            (group.commit_index + 1, target)
        };
        tracing::debug!(group = group_id, from = lo, to = target, "advancing commit position");
        let entries = self
            .storage
            .get_log_entries(group_id, lo, target)
            .await
            .map_err(MultiRaftError::Storage)?;
        for entry in entries {
            match entry.kind {
                LogEntryKind::Command => self.send_event(Event::CommandCommitted {
                    group: group_id,
                    index: entry.index,
                    payload: entry.payload,
                }),
                LogEntryKind::ChangeMembership => self.apply_membership_change(group_id, &entry).await,
            }
        }
        let (prev_log_index, prev_log_term) = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return Ok(());
            };
            group.commit_index = target;
            (group.persisted_last_index, group.persisted_last_term)
        };
        // Followers learn the new commit point from an empty broadcast.
        self.broadcast_entries(group_id, &[], prev_log_index, prev_log_term);
        Ok(())
    }

    /// Apply a committed membership change: mutate the committed membership,
    /// adjust peer connections, and notify the application.
    async fn apply_membership_change(&mut self, group_id: GroupId, entry: &LogEntry) {
        let change = match ChangeMembershipPayload::decode(&entry.payload) {
            Ok(change) => change,
            Err(err) => {
                self.strict_error(format!(
                    "group {} committed a malformed membership change at index {}: {}",
                    group_id, entry.index, err
                ));
                return;
            }
        };
        match change.op {
            MembershipChange::AddMember | MembershipChange::AddObserver => {
                if let Err(err) = self.connect_peer(change.node).await {
                    tracing::warn!(node = change.node, error = %err, "failed to dial newly added group node");
                }
            }
            MembershipChange::RemoveMember | MembershipChange::RemoveObserver => self.release_peer(change.node),
        }
        let members = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return;
            };
            group.committed_members.apply(&change);
            // The change entry is durable here: commit never outruns the
            // persisted log.
            group.persisted_committed_members = group.committed_members.clone();
            group.current_members = group.effective_members();
            if group.current_members.observers.contains(&self.id) && group.role == Role::Follower {
                group.role = Role::Observer;
            } else if group.role == Role::Observer && group.current_members.members.contains(&self.id) {
                group.role = Role::Follower;
            }
            group.persisted_committed_members.clone()
        };
        tracing::info!(group = group_id, ?change, "applied membership change");
        self.send_event(Event::MembershipChanged { group: group_id, members });
    }

    /// Broadcast newly-durable entries (or an empty heartbeat) to every
    /// voting member and observer of the group.
    ///
    /// `prev_log_*` always name a durable point in the leader's log, so this
    /// is only called once the leader's own persistence has completed for
    /// the batch.
    pub(super) fn broadcast_entries(&self, group_id: GroupId, entries: &[LogEntry], prev_log_index: LogIndex, prev_log_term: Term) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        if !group.role.is_leader() {
            return;
        }
        let term = group.election_state.current_term;
        let leader_commit = group.commit_index;
        tracing::trace!(group = group_id, entries = entries.len(), "broadcasting entries");
        for target in group.current_members.all_nodes().filter(|id| *id != self.id) {
            self.send_to_peer(
                target,
                RaftRequest::AppendEntries(AppendEntriesRequest {
                    header: MessageHeader { from: self.id, to: target },
                    group: group_id,
                    term,
                    leader: self.id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                    entries: entries.to_vec(),
                }),
            );
        }
    }
}
