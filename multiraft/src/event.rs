//! Events observable by the application hosting the engine.

use serde::Deserialize;
use serde::Serialize;

use crate::raft::GroupMembers;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;

/// An observable side effect of consensus, delivered on the engine's bounded
/// event stream.
///
/// The stream is in commit order per group. The owner is responsible for
/// draining it in a timely manner; sustained backpressure is fatal, because
/// dropping events would silently lose committed entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// This node has become the leader of a group.
    LeaderElection {
        /// The group which elected a leader.
        group: GroupId,
        /// The elected node.
        leader: NodeId,
    },
    /// A command has been committed and may be applied by the application.
    CommandCommitted {
        /// The group whose log committed the command.
        group: GroupId,
        /// The command's position in the group's log.
        index: LogIndex,
        /// The opaque command payload, exactly as submitted.
        payload: Vec<u8>,
    },
    /// A membership change has been committed for a group.
    MembershipChanged {
        /// The group whose membership changed.
        group: GroupId,
        /// The membership now in effect.
        members: GroupMembers,
    },
}
