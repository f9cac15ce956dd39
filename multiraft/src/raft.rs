//! Public engine interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::clock::WallClock;
use crate::config::Config;
use crate::core::CoreRuntime;
use crate::core::MultiRaftCore;
use crate::error::ConfigError;
use crate::error::CreateGroupError;
use crate::error::MultiRaftError;
use crate::error::MultiRaftResult;
use crate::error::SubmitError;
use crate::event::Event;
use crate::network::MessageSink;
use crate::storage::Storage;
use crate::Transport;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// The capacity of the application-facing event stream.
pub(crate) const EVENTS_CHANNEL_CAPACITY: usize = 1000;
/// The capacity of the application op intake channel.
pub(crate) const OPS_CHANNEL_CAPACITY: usize = 100;
/// The capacity of the inbound request and response channels.
pub(crate) const RPC_CHANNEL_CAPACITY: usize = 100;

/// The channel on which an RPC's (possibly durability-gated) response is delivered.
pub(crate) type RaftReplyTx = oneshot::Sender<Result<RaftResponse, MultiRaftError>>;

/// A trait for producing a compact log-friendly summary of a message.
pub trait MessageSummary {
    /// A one-line summary of this message.
    fn summary(&self) -> String;
}

struct MultiRaftInner<S: Storage, T: Transport> {
    id: NodeId,
    config: Arc<Config>,
    transport: Arc<T>,
    tx_ops: mpsc::Sender<Op>,
    events: Mutex<Option<mpsc::Receiver<Event>>>,
    runtime: Mutex<Option<CoreRuntime<S, T>>>,
    core_handle: Mutex<Option<JoinHandle<MultiRaftResult<()>>>>,
}

/// A local node hosting many independent consensus groups.
///
/// One instance runs per node. All groups share the engine's event loop,
/// write pipeline and peer connections, so hosting another group costs no
/// additional timers, threads or fsync streams.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### events
/// The owner is responsible for consuming the stream returned by
/// [`event_stream`](MultiRaft::event_stream) in a timely manner.
pub struct MultiRaft<S: Storage, T: Transport> {
    inner: Arc<MultiRaftInner<S, T>>,
}

impl<S: Storage, T: Transport> MultiRaft<S, T> {
    /// Create a new engine for the given node, using the wall clock.
    ///
    /// Registers the engine as `transport`'s message handler for `id`; the
    /// event loop is not launched until [`start`](MultiRaft::start) is called.
    pub async fn new(id: NodeId, config: Arc<Config>, storage: Arc<S>, transport: Arc<T>) -> MultiRaftResult<Self> {
        Self::new_with_clock(id, config, storage, transport, Arc::new(WallClock)).await
    }

    /// Create a new engine with a caller-provided [`Clock`], for
    /// deterministic testing.
    #[tracing::instrument(level = "debug", skip(config, storage, transport, clock))]
    pub async fn new_with_clock(
        id: NodeId,
        config: Arc<Config>,
        storage: Arc<S>,
        transport: Arc<T>,
        clock: Arc<dyn Clock>,
    ) -> MultiRaftResult<Self> {
        if id == 0 {
            return Err(ConfigError::InvalidNodeId.into());
        }
        let (tx_ops, rx_ops) = mpsc::channel(OPS_CHANNEL_CAPACITY);
        let (tx_requests, rx_requests) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        let (tx_responses, rx_responses) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        let (tx_events, rx_events) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);

        let sink = MessageSink::new(tx_requests, config.strict);
        transport.listen(id, sink).await.map_err(MultiRaftError::Transport)?;

        let runtime = CoreRuntime {
            storage,
            transport: transport.clone(),
            clock,
            rx_ops,
            rx_requests,
            tx_responses,
            rx_responses,
            tx_events,
        };
        let inner = MultiRaftInner {
            id,
            config,
            transport,
            tx_ops,
            events: Mutex::new(Some(rx_events)),
            runtime: Mutex::new(Some(runtime)),
            core_handle: Mutex::new(None),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Launch the event loop and the write task.
    ///
    /// Calling `start` more than once has no effect.
    pub async fn start(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if let Some(runtime) = runtime.take() {
            let handle = MultiRaftCore::spawn(self.inner.id, self.inner.config.clone(), runtime);
            *self.inner.core_handle.lock().await = Some(handle);
        }
    }

    /// Take the engine's bounded, in-order event stream.
    ///
    /// Returns `None` if the stream has already been taken.
    pub async fn event_stream(&self) -> Option<mpsc::Receiver<Event>> {
        self.inner.events.lock().await.take()
    }

    /// Create a new consensus group and join it.
    ///
    /// The application should arrange to call `create_group` on every node
    /// named in `initial_members`. Completes once the group is installed and
    /// peer connections are established.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn create_group(&self, group: GroupId, initial_members: Vec<NodeId>) -> Result<(), CreateGroupError> {
        if initial_members.iter().any(|id| *id == 0) {
            return Err(CreateGroupError::InvalidNodeId);
        }
        let (tx, rx) = oneshot::channel();
        self.send_op::<CreateGroupError>(Op::CreateGroup {
            group,
            members: initial_members,
            tx,
        })
        .await?;
        rx.await.map_err(|_| CreateGroupError::Raft(MultiRaftError::ShuttingDown))?
    }

    /// Submit a command (an opaque binary blob) to a group.
    ///
    /// Completes once the command has been appended to the leader's
    /// in-memory log, not once it has been committed; commits are observable
    /// on the event stream.
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub async fn submit_command(&self, group: GroupId, command: Vec<u8>) -> Result<(), SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.send_op::<SubmitError>(Op::SubmitCommand { group, command, tx }).await?;
        rx.await.map_err(|_| SubmitError::Raft(MultiRaftError::ShuttingDown))?
    }

    /// Submit a proposed membership change to a group.
    ///
    /// Identical completion semantics to
    /// [`submit_command`](MultiRaft::submit_command): the change is appended
    /// as a `ChangeMembership` log entry and takes effect when it commits.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_group_membership(
        &self,
        group: GroupId,
        change: MembershipChange,
        node: NodeId,
    ) -> Result<(), SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.send_op::<SubmitError>(Op::ChangeMembership { group, change, node, tx }).await?;
        rx.await.map_err(|_| SubmitError::Raft(MultiRaftError::ShuttingDown))?
    }

    /// Stop the engine: close peer connections, stop the write task, and
    /// await event loop exit.
    ///
    /// Idempotent from the caller's perspective.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn stop(&self) -> MultiRaftResult<()> {
        self.inner.transport.stop(self.inner.id).await;
        // The loop may already be gone; a closed op channel is not an error here.
        let _ = self.inner.tx_ops.send(Op::Stop).await;
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            match handle.await {
                Ok(res) => res?,
                Err(err) => tracing::error!(error=%err, "multiraft core task panicked or was cancelled"),
            }
        }
        Ok(())
    }

    /// Enqueue an op for the event loop, preferring a non-blocking send.
    async fn send_op<E: From<MultiRaftError>>(&self, op: Op) -> Result<(), E> {
        match self.inner.tx_ops.try_send(op) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(op)) => {
                if self.inner.config.strict {
                    panic!("multiraft: op channel blocked");
                }
                tracing::error!("op channel blocked, falling back to blocking send");
                self.inner.tx_ops.send(op).await.map_err(|_| MultiRaftError::ShuttingDown.into())
            }
            Err(TrySendError::Closed(_)) => Err(MultiRaftError::ShuttingDown.into()),
        }
    }
}

impl<S: Storage, T: Transport> Clone for MultiRaft<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// An application op submitted to the event loop.
///
/// Each op carries its own completion channel so errors never bubble into
/// unrelated groups.
pub(crate) enum Op {
    CreateGroup {
        group: GroupId,
        members: Vec<NodeId>,
        tx: oneshot::Sender<Result<(), CreateGroupError>>,
    },
    SubmitCommand {
        group: GroupId,
        command: Vec<u8>,
        tx: oneshot::Sender<Result<(), SubmitError>>,
    },
    ChangeMembership {
        group: GroupId,
        change: MembershipChange,
        node: NodeId,
        tx: oneshot::Sender<Result<(), SubmitError>>,
    },
    Stop,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The source and destination of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// The sending node.
    pub from: NodeId,
    /// The receiving node.
    pub to: NodeId,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub header: MessageHeader,
    /// The target consensus group.
    pub group: GroupId,
    /// The candidate's current term.
    pub term: Term,
    /// The campaigning node.
    pub candidate: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// The response to a `RequestVoteRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub header: MessageHeader,
    /// The current term of the responding node, for the candidate to update itself.
    pub term: Term,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by a group leader to replicate log entries (§5.3), and as a
/// heartbeat carrying the commit position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub header: MessageHeader,
    /// The target consensus group.
    pub group: GroupId,
    /// The leader's current term.
    pub term: Term,
    /// The leader's id.
    pub leader: NodeId,
    /// The index of the entry immediately preceding `entries` in the
    /// leader's durable log.
    pub prev_log_index: LogIndex,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
    /// The new log entries to store. Empty for a pure commit-position
    /// heartbeat.
    pub entries: Vec<LogEntry>,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub header: MessageHeader,
    /// The responding node's current term, for the leader to update itself.
    pub term: Term,
    /// Whether the entries were accepted.
    pub success: bool,
}

/// The closed set of requests carried by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

impl RaftRequest {
    /// The group this request is addressed to.
    pub fn group(&self) -> GroupId {
        match self {
            RaftRequest::RequestVote(req) => req.group,
            RaftRequest::AppendEntries(req) => req.group,
        }
    }

    /// The message header.
    pub fn header(&self) -> &MessageHeader {
        match self {
            RaftRequest::RequestVote(req) => &req.header,
            RaftRequest::AppendEntries(req) => &req.header,
        }
    }
}

impl MessageSummary for RaftRequest {
    fn summary(&self) -> String {
        match self {
            RaftRequest::RequestVote(req) => format!(
                "RequestVote: group={}, term={}, candidate={}, last_log_index={}, last_log_term={}",
                req.group, req.term, req.candidate, req.last_log_index, req.last_log_term
            ),
            RaftRequest::AppendEntries(req) => format!(
                "AppendEntries: group={}, term={}, leader={}, prev_log_index={}, prev_log_term={}, leader_commit={}, entries={}",
                req.group,
                req.term,
                req.leader,
                req.prev_log_index,
                req.prev_log_term,
                req.leader_commit,
                req.entries.len()
            ),
        }
    }
}

/// The closed set of responses carried by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A single entry in a group's replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term in which the entry was proposed.
    pub term: Term,
    /// The entry's 1-based position in the log.
    pub index: LogIndex,
    /// What the payload carries.
    pub kind: LogEntryKind,
    /// The entry payload. Opaque to the engine for `Command` entries.
    pub payload: Vec<u8>,
}

/// Log entry payload variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryKind {
    /// An application command, uninterpreted by the engine.
    Command,
    /// A serialized [`ChangeMembershipPayload`].
    ChangeMembership,
}

/// The membership of a consensus group.
///
/// Voting members participate in elections and quorums; observers receive
/// replicated entries but do not vote.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembers {
    /// The voting members.
    pub members: BTreeSet<NodeId>,
    /// The non-voting observers.
    pub observers: BTreeSet<NodeId>,
}

impl GroupMembers {
    /// Create a membership of the given voting members and no observers.
    pub fn new(members: BTreeSet<NodeId>) -> Self {
        Self {
            members,
            observers: BTreeSet::new(),
        }
    }

    /// Check whether the given node is a member or an observer.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id) || self.observers.contains(id)
    }

    /// All members and observers, in order.
    pub fn all_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().chain(self.observers.iter()).copied()
    }

    /// Apply a single membership change.
    ///
    /// Adding a node in one set removes it from the other, so a node can be
    /// cycled observer -> member and back without an intermediate removal.
    pub fn apply(&mut self, change: &ChangeMembershipPayload) {
        match change.op {
            MembershipChange::AddMember => {
                self.observers.remove(&change.node);
                self.members.insert(change.node);
            }
            MembershipChange::RemoveMember => {
                self.members.remove(&change.node);
            }
            MembershipChange::AddObserver => {
                self.members.remove(&change.node);
                self.observers.insert(change.node);
            }
            MembershipChange::RemoveObserver => {
                self.observers.remove(&change.node);
            }
        }
    }
}

/// The kinds of membership change a group accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    AddMember,
    RemoveMember,
    AddObserver,
    RemoveObserver,
}

/// The payload of a `ChangeMembership` log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMembershipPayload {
    /// The change to apply.
    pub op: MembershipChange,
    /// The node the change applies to.
    pub node: NodeId,
}

impl ChangeMembershipPayload {
    /// Serialize for embedding in a log entry.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from a log entry payload.
    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}
