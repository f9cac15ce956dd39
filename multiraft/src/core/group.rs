//! Per-group consensus state.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use tokio::time::Instant;

use crate::core::pending::PendingCall;
use crate::core::Role;
use crate::raft::ChangeMembershipPayload;
use crate::raft::GroupMembers;
use crate::raft::LogEntry;
use crate::raft::LogEntryKind;
use crate::storage::ElectionState;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// The state of a single consensus group hosted on this node.
///
/// When an RPC is received (or another event occurs), the in-memory fields
/// are updated immediately; the `persisted_*` mirrors are updated later,
/// once the write task acknowledges the corresponding batch. The group is
/// "dirty" whenever the current and persisted data differ.
pub(crate) struct Group {
    pub(crate) id: GroupId,

    // In-memory latest state.
    pub(crate) election_state: ElectionState,
    pub(crate) committed_members: GroupMembers,
    pub(crate) last_log_index: LogIndex,
    pub(crate) last_log_term: Term,
    /// Log entries not yet handed to the write task.
    pub(crate) pending_entries: Vec<LogEntry>,

    // Persisted mirror.
    pub(crate) persisted_election_state: Option<ElectionState>,
    pub(crate) persisted_committed_members: GroupMembers,
    pub(crate) persisted_last_index: LogIndex,
    pub(crate) persisted_last_term: Term,

    // Volatile state.
    pub(crate) role: Role,
    /// The last commit index received from the leader.
    pub(crate) leader_commit_index: LogIndex,
    /// The last index issued to the application as committed. The smaller of
    /// `leader_commit_index` (or the quorum index, on a leader) and
    /// `persisted_last_index`.
    pub(crate) commit_index: LogIndex,
    pub(crate) election_deadline: Instant,
    /// Votes granted to this node in the current campaign.
    pub(crate) votes: BTreeSet<NodeId>,

    /// The membership used while campaigning or leading: the committed
    /// membership plus any pending changes observed in the uncommitted tail.
    /// Snapshotted on conversion to candidate.
    pub(crate) current_members: GroupMembers,

    // Leader volatile state. Reset on election.
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,

    /// Inbound RPCs whose responses are gated on persistence, in insertion order.
    pub(crate) pending_calls: VecDeque<PendingCall>,
}

impl Group {
    pub(crate) fn new(id: GroupId, members: BTreeSet<NodeId>, election_deadline: Instant) -> Self {
        let committed_members = GroupMembers::new(members);
        Self {
            id,
            election_state: ElectionState::default(),
            current_members: committed_members.clone(),
            persisted_committed_members: committed_members.clone(),
            committed_members,
            last_log_index: 0,
            last_log_term: 0,
            pending_entries: Vec::new(),
            persisted_election_state: None,
            persisted_last_index: 0,
            persisted_last_term: 0,
            role: Role::Follower,
            leader_commit_index: 0,
            commit_index: 0,
            election_deadline,
            votes: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending_calls: VecDeque::new(),
        }
    }

    /// Whether in-memory state has advanced beyond the persisted mirror.
    pub(crate) fn is_dirty(&self) -> bool {
        self.persisted_election_state.as_ref() != Some(&self.election_state) || !self.pending_entries.is_empty()
    }

    /// The largest log index that a quorum of the voting members has durably
    /// stored, per `match_index`.
    pub(crate) fn find_quorum_index(&self) -> LogIndex {
        let mut indices: Vec<LogIndex> = self
            .current_members
            .members
            .iter()
            .map(|id| self.match_index.get(id).copied().unwrap_or(0))
            .collect();
        if indices.is_empty() {
            return 0;
        }
        indices.sort_unstable();
        // Ascending sort: everything at or after this position is stored by
        // a strict majority of the voting members.
        indices[(indices.len() - 1) / 2]
    }

    /// Whether the votes gathered so far form a strict majority of the
    /// voting members. Exactly half is not a quorum.
    pub(crate) fn has_majority(&self) -> bool {
        let granted = self.current_members.members.iter().filter(|id| self.votes.contains(id)).count();
        granted * 2 > self.current_members.members.len()
    }

    /// The committed membership with the uncommitted tail's membership
    /// changes applied.
    pub(crate) fn effective_members(&self) -> GroupMembers {
        let mut members = self.committed_members.clone();
        for entry in &self.pending_entries {
            if entry.kind != LogEntryKind::ChangeMembership {
                continue;
            }
            match ChangeMembershipPayload::decode(&entry.payload) {
                Ok(change) => members.apply(&change),
                Err(err) => {
                    tracing::warn!(group = self.id, index = entry.index, error = %err, "skipping malformed membership change in uncommitted tail");
                }
            }
        }
        members
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use super::*;
    use crate::raft::MembershipChange;

    fn group(members: BTreeSet<NodeId>) -> Group {
        Group::new(1, members, Instant::now())
    }

    #[test]
    fn test_quorum_index_odd_members() {
        let mut g = group(btreeset![1, 2, 3]);
        g.match_index.insert(1, 5);
        g.match_index.insert(2, 3);
        g.match_index.insert(3, 1);
        // Two of three nodes have stored index 3.
        assert_eq!(g.find_quorum_index(), 3);
    }

    #[test]
    fn test_quorum_index_even_members() {
        let mut g = group(btreeset![1, 2, 3, 4]);
        g.match_index.insert(1, 9);
        g.match_index.insert(2, 7);
        g.match_index.insert(3, 4);
        g.match_index.insert(4, 0);
        // Three of four nodes are needed for a majority; only index 4 has that.
        assert_eq!(g.find_quorum_index(), 4);
    }

    #[test]
    fn test_quorum_index_defaults_to_zero() {
        let g = group(btreeset![1, 2, 3]);
        assert_eq!(g.find_quorum_index(), 0);
    }

    #[test]
    fn test_majority_requires_strictly_more_than_half() {
        let mut g = group(btreeset![1, 2, 3, 4]);
        g.votes.insert(1);
        g.votes.insert(2);
        assert!(!g.has_majority(), "exactly half is not a quorum");
        g.votes.insert(3);
        assert!(g.has_majority());
    }

    #[test]
    fn test_votes_from_non_members_do_not_count() {
        let mut g = group(btreeset![1, 2, 3]);
        g.votes.insert(1);
        g.votes.insert(9);
        assert!(!g.has_majority());
    }

    #[test]
    fn test_dirty_tracks_election_state_and_pending_entries() {
        let mut g = group(btreeset![1]);
        // A fresh group has nothing persisted, so its zero-valued election
        // state is still considered ahead of storage.
        assert!(g.is_dirty());

        g.persisted_election_state = Some(g.election_state.clone());
        assert!(!g.is_dirty());

        g.election_state.current_term = 1;
        assert!(g.is_dirty());

        g.persisted_election_state = Some(g.election_state.clone());
        assert!(!g.is_dirty());

        g.pending_entries.push(LogEntry {
            term: 1,
            index: 1,
            kind: LogEntryKind::Command,
            payload: b"x".to_vec(),
        });
        assert!(g.is_dirty());
    }

    #[test]
    fn test_effective_members_applies_uncommitted_tail() {
        let mut g = group(btreeset![1, 2, 3]);
        let add = ChangeMembershipPayload {
            op: MembershipChange::AddObserver,
            node: 4,
        };
        g.pending_entries.push(LogEntry {
            term: 1,
            index: 1,
            kind: LogEntryKind::ChangeMembership,
            payload: add.encode().unwrap(),
        });
        let effective = g.effective_members();
        assert_eq!(effective.members, btreeset![1, 2, 3]);
        assert_eq!(effective.observers, btreeset![4]);
        // The committed membership itself is untouched.
        assert!(g.committed_members.observers.is_empty());
    }
}
