//! Durability-gated responses to inbound RPCs.

use crate::core::group::Group;
use crate::error::MultiRaftError;
use crate::raft::RaftReplyTx;
use crate::raft::RaftResponse;
use crate::storage::ElectionState;
use crate::LogIndex;
use crate::Term;

/// An inbound RPC whose prepared response must not be sent until this node
/// has persisted up to the given thresholds.
///
/// A `None` threshold means the RPC did not modify that variable and the
/// call can be resolved regardless of its value.
pub(crate) struct PendingCall {
    reply: RaftReplyTx,
    response: RaftResponse,
    term: Option<Term>,
    log_index: Option<LogIndex>,
}

impl PendingCall {
    pub(crate) fn new(reply: RaftReplyTx, response: RaftResponse, term: Option<Term>, log_index: Option<LogIndex>) -> Self {
        Self {
            reply,
            response,
            term,
            log_index,
        }
    }

    fn is_resolvable(&self, persisted_election_state: Option<&ElectionState>, persisted_last_index: LogIndex) -> bool {
        let Some(election_state) = persisted_election_state else {
            return false;
        };
        if let Some(term) = self.term {
            if term > election_state.current_term {
                return false;
            }
        }
        if let Some(log_index) = self.log_index {
            if log_index > persisted_last_index {
                return false;
            }
        }
        true
    }

    fn deliver(self) {
        let _ = self.reply.send(Ok(self.response));
    }
}

impl Group {
    /// Register a durability-gated reply, delivering it immediately if the
    /// persisted state already satisfies its thresholds.
    pub(crate) fn register_pending_call(&mut self, call: PendingCall) {
        if call.is_resolvable(self.persisted_election_state.as_ref(), self.persisted_last_index) {
            call.deliver();
        } else {
            self.pending_calls.push_back(call);
        }
    }

    /// Scan the pending list once, in insertion order, delivering every call
    /// whose thresholds the persisted state now satisfies.
    pub(crate) fn resolve_pending_calls(&mut self) {
        let mut idx = 0;
        while idx < self.pending_calls.len() {
            let resolvable = self.pending_calls[idx].is_resolvable(self.persisted_election_state.as_ref(), self.persisted_last_index);
            if resolvable {
                if let Some(call) = self.pending_calls.remove(idx) {
                    call.deliver();
                }
            } else {
                idx += 1;
            }
        }
    }

    /// Fail every pending call; used on shutdown so callers are not left hanging.
    pub(crate) fn fail_pending_calls(&mut self) {
        for call in self.pending_calls.drain(..) {
            let _ = call.reply.send(Err(MultiRaftError::ShuttingDown));
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
