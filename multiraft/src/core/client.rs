//! Application op handling.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::core::group::Group;
use crate::core::MultiRaftCore;
use crate::error::CreateGroupError;
use crate::error::SubmitError;
use crate::network::Transport;
use crate::raft::ChangeMembershipPayload;
use crate::raft::LogEntry;
use crate::raft::LogEntryKind;
use crate::raft::MembershipChange;
use crate::storage::Storage;
use crate::GroupId;
use crate::NodeId;

impl<S: Storage, T: Transport> MultiRaftCore<S, T> {
    /// Install a new consensus group, establishing (or reference-counting)
    /// a connection to each initial member.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn create_group(
        &mut self,
        group_id: GroupId,
        members: Vec<NodeId>,
        tx: oneshot::Sender<Result<(), CreateGroupError>>,
    ) {
        if self.groups.contains_key(&group_id) {
            let _ = tx.send(Err(CreateGroupError::GroupExists(group_id)));
            return;
        }
        let member_set: BTreeSet<NodeId> = members.into_iter().collect();
        let mut dialed = Vec::new();
        for &member in &member_set {
            match self.connect_peer(member).await {
                Ok(()) => dialed.push(member),
                Err(err) => {
                    // Leave the peer table exactly as it was found.
                    for member in dialed {
                        self.release_peer(member);
                    }
                    let _ = tx.send(Err(CreateGroupError::TransportDialFailed { node: member, source: err }));
                    return;
                }
            }
        }
        let deadline = self.random_election_deadline();
        self.groups.insert(group_id, Group::new(group_id, member_set, deadline));
        tracing::debug!(group = group_id, "group created");
        let _ = tx.send(Ok(()));
    }

    #[tracing::instrument(level = "debug", skip(self, command, tx))]
    pub(super) fn submit_command(&mut self, group_id: GroupId, command: Vec<u8>, tx: oneshot::Sender<Result<(), SubmitError>>) {
        let _ = tx.send(self.add_log_entry(group_id, LogEntryKind::Command, command));
    }

    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) fn change_group_membership(
        &mut self,
        group_id: GroupId,
        change: MembershipChange,
        node: NodeId,
        tx: oneshot::Sender<Result<(), SubmitError>>,
    ) {
        let payload = ChangeMembershipPayload { op: change, node };
        let payload = match payload.encode() {
            Ok(payload) => payload,
            Err(err) => {
                self.strict_error(format!("failed to encode membership change for group {}: {}", group_id, err));
                let _ = tx.send(Err(SubmitError::Raft(crate::error::MultiRaftError::ShuttingDown)));
                return;
            }
        };
        let _ = tx.send(self.add_log_entry(group_id, LogEntryKind::ChangeMembership, payload));
    }

    /// Append an entry to the leader's in-memory log and mark the group
    /// dirty. Does not wait for durability or commit.
    fn add_log_entry(&mut self, group_id: GroupId, kind: LogEntryKind, payload: Vec<u8>) -> Result<(), SubmitError> {
        {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return Err(SubmitError::GroupNotFound(group_id));
            };
            if !group.role.is_leader() {
                return Err(SubmitError::NotLeader(group_id));
            }
            group.last_log_index += 1;
            let entry = LogEntry {
                term: group.election_state.current_term,
                index: group.last_log_index,
                kind,
                payload,
            };
            tracing::trace!(group = group_id, index = entry.index, ?kind, "appended entry to in-memory log");
            group.pending_entries.push(entry);
        }
        self.update_dirty_status(group_id);
        Ok(())
    }
}
