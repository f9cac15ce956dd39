//! The election subsystem.

use crate::core::pending::PendingCall;
use crate::core::MultiRaftCore;
use crate::core::Role;
use crate::event::Event;
use crate::network::Transport;
use crate::raft::MessageHeader;
use crate::raft::RaftReplyTx;
use crate::raft::RaftRequest;
use crate::raft::RaftResponse;
use crate::raft::RequestVoteRequest;
use crate::raft::RequestVoteResponse;
use crate::storage::Storage;
use crate::GroupId;
use crate::NodeId;

impl<S: Storage, T: Transport> MultiRaftCore<S, T> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    ///
    /// The response is withheld until the updated election state is durable
    /// on this node.
    #[tracing::instrument(level = "trace", skip(self, req, tx), fields(group = req.group, candidate = req.candidate))]
    pub(super) fn handle_request_vote(&mut self, req: RequestVoteRequest, tx: RaftReplyTx) {
        let group_id = req.group;
        {
            let Some(group) = self.groups.get_mut(&group_id) else {
                tracing::warn!(group = group_id, "vote request for unknown group");
                let _ = tx.send(Err(crate::error::MultiRaftError::GroupNotFound(group_id)));
                return;
            };
            // A vote from an older term does not carry over.
            if req.term > group.election_state.current_term {
                group.election_state.current_term = req.term;
                group.election_state.voted_for = None;
            }
            let log_up_to_date = req.last_log_term > group.last_log_term
                || (req.last_log_term == group.last_log_term && req.last_log_index >= group.last_log_index);
            let vote_granted = if req.term < group.election_state.current_term {
                false
            } else if !log_up_to_date {
                tracing::debug!(candidate = req.candidate, "rejecting vote request, candidate log is not up-to-date");
                false
            } else {
                match group.election_state.voted_for {
                    Some(voted_for) if voted_for != req.candidate => false,
                    _ => {
                        group.election_state.voted_for = Some(req.candidate);
                        true
                    }
                }
            };
            tracing::debug!(
                granted = vote_granted,
                candidate = req.candidate,
                term = req.term,
                "responding to vote request"
            );
            let response = RaftResponse::RequestVote(RequestVoteResponse {
                header: MessageHeader {
                    from: self.id,
                    to: req.header.from,
                },
                term: group.election_state.current_term,
                vote_granted,
            });
            let min_term = group.election_state.current_term;
            group.register_pending_call(PendingCall::new(tx, response, Some(min_term), None));
        }
        self.update_dirty_status(group_id);
    }

    /// Handle a vote response from a peer. Responses from older terms are
    /// ignored; votes are recorded by the responding node's id.
    #[tracing::instrument(level = "trace", skip(self, req, resp), fields(group = req.group, from = req.header.to))]
    pub(super) fn handle_request_vote_response(&mut self, req: RequestVoteRequest, resp: RequestVoteResponse) {
        let group_id = req.group;
        {
            let Some(group) = self.groups.get_mut(&group_id) else {
                tracing::warn!(group = group_id, "vote response for unknown group");
                return;
            };
            if resp.term < group.election_state.current_term {
                tracing::trace!(group = group_id, term = resp.term, "ignoring vote response from an older term");
                return;
            }
            if resp.vote_granted {
                group.votes.insert(req.header.to);
            }
        }
        self.count_votes(group_id);
        self.update_dirty_status(group_id);
    }

    /// Convert from candidate to leader once a strict majority of the
    /// voting members have granted their votes.
    fn count_votes(&mut self, group_id: GroupId) {
        let became_leader = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return;
            };
            if group.role.is_candidate() && group.has_majority() {
                group.role = Role::Leader;
                let next = group.last_log_index + 1;
                group.next_index = group.current_members.all_nodes().map(|id| (id, next)).collect();
                group.match_index = group.current_members.all_nodes().map(|id| (id, 0)).collect();
                group.match_index.insert(self.id, group.persisted_last_index);
                true
            } else {
                false
            }
        };
        if became_leader {
            tracing::info!(group = group_id, "becoming leader");
            self.send_event(Event::LeaderElection {
                group: group_id,
                leader: self.id,
            });
        }
    }

    /// Begin a new campaign for a group whose election deadline has passed.
    ///
    /// A leader never reaches this path; attempting the transition is a
    /// programming error.
    pub(super) fn become_candidate(&mut self, group_id: GroupId) {
        match self.groups.get(&group_id) {
            Some(group) if group.role.is_leader() => {
                self.strict_error(format!("group {} cannot transition from leader to candidate", group_id));
                return;
            }
            Some(_) => {}
            None => return,
        }
        let deadline = self.random_election_deadline();
        let (term, last_log_index, last_log_term, members) = {
            let Some(group) = self.groups.get_mut(&group_id) else {
                return;
            };
            tracing::info!(group = group_id, prior_role = ?group.role, term = group.election_state.current_term + 1, "becoming candidate");
            group.role = Role::Candidate;
            group.election_state.current_term += 1;
            group.election_state.voted_for = Some(self.id);
            group.votes.clear();
            group.current_members = group.effective_members();
            group.election_deadline = deadline;
            let members: Vec<NodeId> = group.current_members.members.iter().copied().collect();
            (group.election_state.current_term, group.last_log_index, group.last_log_term, members)
        };
        // The vote request is sent to ourselves as well, rather than marking
        // the vote directly. One code path covers every case, including a
        // node that has been removed from the group conducting the election
        // for its replacement.
        for target in members {
            self.send_to_peer(
                target,
                RaftRequest::RequestVote(RequestVoteRequest {
                    header: MessageHeader { from: self.id, to: target },
                    group: group_id,
                    term,
                    candidate: self.id,
                    last_log_index,
                    last_log_term,
                }),
            );
        }
        self.update_dirty_status(group_id);
    }
}
