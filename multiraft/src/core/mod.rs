//! The core logic of a multiraft node.

mod append_entries;
mod client;
pub(crate) mod group;
pub(crate) mod pending;
mod vote;
mod write;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::clock::Clock;
use crate::config::Config;
use crate::core::group::Group;
use crate::core::write::WriteTask;
use crate::error::MultiRaftError;
use crate::error::MultiRaftResult;
use crate::event::Event;
use crate::network::Connection;
use crate::network::InboundCall;
use crate::network::Transport;
use crate::raft::MessageSummary;
use crate::raft::Op;
use crate::raft::RaftRequest;
use crate::raft::RaftResponse;
use crate::storage::GroupWriteRequest;
use crate::storage::Storage;
use crate::storage::WriteRequest;
use crate::GroupId;
use crate::NodeId;

/// The role of this node within a single group.
///
/// Observers receive replicated logs but do not vote. There is at most one
/// leader per term; a node cannot become a leader without first becoming a
/// candidate and winning an election.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Receives replication but neither votes nor campaigns.
    Observer,
    /// Replicating entries from the group's leader.
    Follower,
    /// Campaigning to become the group's leader.
    Candidate,
    /// Leading the group.
    Leader,
}

impl Role {
    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Whether this role runs an election timer.
    pub(crate) fn has_election_timer(&self) -> bool {
        !matches!(self, Self::Leader | Self::Observer)
    }
}

/// The channels and collaborators handed from the public handle to the core
/// when the loop is launched.
pub(crate) struct CoreRuntime<S: Storage, T: Transport> {
    pub(crate) storage: Arc<S>,
    pub(crate) transport: Arc<T>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rx_ops: mpsc::Receiver<Op>,
    pub(crate) rx_requests: mpsc::Receiver<InboundCall>,
    pub(crate) tx_responses: mpsc::Sender<(RaftRequest, RaftResponse)>,
    pub(crate) rx_responses: mpsc::Receiver<(RaftRequest, RaftResponse)>,
    pub(crate) tx_events: mpsc::Sender<Event>,
}

/// A reference-counted connection to a remote node, shared by every group
/// which includes that peer.
pub(crate) struct PeerConn {
    pub(crate) ref_count: usize,
    /// The peer's outbound request queue.
    pub(crate) tx: mpsc::UnboundedSender<RaftRequest>,
}

/// The core type driving every consensus group on this node.
///
/// All fields are owned by the single event-loop task, so no locks protect
/// them: the loop is the sole mutator of group state, the dirty set and the
/// peer table.
pub(crate) struct MultiRaftCore<S: Storage, T: Transport> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) storage: Arc<S>,
    pub(crate) transport: Arc<T>,
    pub(crate) clock: Arc<dyn Clock>,

    pub(crate) groups: HashMap<GroupId, Group>,
    /// Groups whose in-memory state has advanced beyond their persisted mirror.
    pub(crate) dirty_groups: HashSet<GroupId>,
    pub(crate) peers: HashMap<NodeId, PeerConn>,

    pub(crate) write_task: WriteTask,

    rx_ops: mpsc::Receiver<Op>,
    rx_requests: mpsc::Receiver<InboundCall>,
    tx_responses: mpsc::Sender<(RaftRequest, RaftResponse)>,
    rx_responses: mpsc::Receiver<(RaftRequest, RaftResponse)>,
    tx_events: mpsc::Sender<Event>,
}

impl<S: Storage, T: Transport> MultiRaftCore<S, T> {
    pub(crate) fn spawn(id: NodeId, config: Arc<Config>, runtime: CoreRuntime<S, T>) -> JoinHandle<MultiRaftResult<()>> {
        let write_task = WriteTask::spawn(runtime.storage.clone());
        let this = Self {
            id,
            config,
            storage: runtime.storage,
            transport: runtime.transport,
            clock: runtime.clock,
            groups: HashMap::new(),
            dirty_groups: HashSet::new(),
            peers: HashMap::new(),
            write_task,
            rx_ops: runtime.rx_ops,
            rx_requests: runtime.rx_requests,
            tx_responses: runtime.tx_responses,
            rx_responses: runtime.rx_responses,
            tx_events: runtime.tx_events,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    async fn main(mut self) -> MultiRaftResult<()> {
        tracing::info!("multiraft node starting");
        let res = self.run_loop().await;
        if let Err(err) = &res {
            tracing::error!(error = %err, "multiraft node terminating on fatal error");
        }
        self.shutdown().await;
        res
    }

    /// The main loop: the sole mutator of all group state.
    ///
    /// Handlers are non-blocking apart from storage awaits; the loop
    /// otherwise suspends only at this multi-way wait.
    async fn run_loop(&mut self) -> MultiRaftResult<()> {
        loop {
            let timer: BoxFuture<'static, ()> = match self.next_election_deadline() {
                Some(deadline) => self.clock.sleep_until(deadline),
                None => Box::pin(std::future::pending()),
            };
            let write_tx = self.write_task.tx.clone();
            tokio::select! {
                maybe_op = self.rx_ops.recv() => match maybe_op {
                    None | Some(Op::Stop) => {
                        tracing::debug!("stop requested");
                        return Ok(());
                    }
                    Some(Op::CreateGroup { group, members, tx }) => self.create_group(group, members, tx).await,
                    Some(Op::SubmitCommand { group, command, tx }) => self.submit_command(group, command, tx),
                    Some(Op::ChangeMembership { group, change, node, tx }) => self.change_group_membership(group, change, node, tx),
                },
                Some(call) = self.rx_requests.recv() => self.handle_request(call).await?,
                Some((request, response)) = self.rx_responses.recv() => self.handle_response(request, response).await?,
                // Offer a new batch to the write task only while something is dirty.
                Ok(permit) = write_tx.reserve(), if !self.dirty_groups.is_empty() => {
                    let request = take_write_request(&mut self.groups, &self.dirty_groups);
                    permit.send(request);
                }
                Some(res) = self.write_task.rx.recv() => {
                    let response = res.map_err(MultiRaftError::Storage)?;
                    self.handle_write_response(response).await?;
                }
                _ = timer => self.handle_election_timeouts(),
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::debug!(id = self.id, "multiraft node stopping");
        // Dropping the outbound queues lets each peer task finish its
        // in-flight call and close its connection.
        self.peers.clear();
        self.write_task.shutdown().await;
        for group in self.groups.values_mut() {
            group.fail_pending_calls();
        }
    }

    #[tracing::instrument(level = "trace", skip(self, call), fields(request = %call.request.summary()))]
    async fn handle_request(&mut self, call: InboundCall) -> MultiRaftResult<()> {
        match call.request {
            RaftRequest::RequestVote(req) => self.handle_request_vote(req, call.tx),
            RaftRequest::AppendEntries(req) => self.handle_append_entries(req, call.tx).await?,
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, request, response), fields(request = %request.summary()))]
    async fn handle_response(&mut self, request: RaftRequest, response: RaftResponse) -> MultiRaftResult<()> {
        match (request, response) {
            (RaftRequest::RequestVote(req), RaftResponse::RequestVote(resp)) => {
                self.handle_request_vote_response(req, resp);
            }
            (RaftRequest::AppendEntries(req), RaftResponse::AppendEntries(resp)) => {
                self.handle_append_entries_response(req, resp).await?;
            }
            (request, _) => {
                self.strict_error(format!("mismatched rpc response for request: {}", request.summary()));
            }
        }
        Ok(())
    }

    /// The engine's next wakeup: the soonest election deadline among groups
    /// which run an election timer.
    fn next_election_deadline(&self) -> Option<Instant> {
        self.groups
            .values()
            .filter(|g| g.role.has_election_timer())
            .map(|g| g.election_deadline)
            .min()
    }

    fn handle_election_timeouts(&mut self) {
        let now = self.clock.now();
        let expired: Vec<GroupId> = self
            .groups
            .values()
            .filter(|g| g.role.has_election_timer() && now >= g.election_deadline)
            .map(|g| g.id)
            .collect();
        for group in expired {
            self.become_candidate(group);
        }
    }

    /// Roll a fresh randomized election deadline.
    pub(super) fn random_election_deadline(&self) -> Instant {
        self.clock.now() + Duration::from_millis(self.config.new_rand_election_timeout())
    }

    /// Recompute whether `group` belongs in the dirty set.
    pub(super) fn update_dirty_status(&mut self, group: GroupId) {
        let dirty = self.groups.get(&group).map(|g| g.is_dirty()).unwrap_or(false);
        if dirty {
            self.dirty_groups.insert(group);
        } else {
            self.dirty_groups.remove(&group);
        }
    }

    /// Enqueue a fire-and-forget request on the peer's outbound queue.
    ///
    /// The response arrives asynchronously on the shared response channel,
    /// correlated by the original request.
    pub(super) fn send_to_peer(&self, target: NodeId, request: RaftRequest) {
        match self.peers.get(&target) {
            Some(peer) => {
                if peer.tx.send(request).is_err() {
                    tracing::warn!(peer = target, "peer task is gone, dropping request");
                }
            }
            None => tracing::warn!(peer = target, "no connection to peer, dropping request"),
        }
    }

    /// Dial `node` if this is the first group referencing it, otherwise bump
    /// the connection's refcount.
    pub(super) async fn connect_peer(&mut self, node: NodeId) -> Result<(), anyhow::Error> {
        if let Some(peer) = self.peers.get_mut(&node) {
            peer.ref_count += 1;
            return Ok(());
        }
        let conn = self.transport.connect(node).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let tx_responses = self.tx_responses.clone();
        tokio::spawn(peer_loop(node, conn, rx, tx_responses).instrument(tracing::debug_span!("peer", peer = node)));
        self.peers.insert(node, PeerConn { ref_count: 1, tx });
        Ok(())
    }

    /// Drop one reference to `node`'s connection.
    ///
    /// The connection itself stays open until engine stop, even at a
    /// refcount of zero.
    pub(super) fn release_peer(&mut self, node: NodeId) {
        if let Some(peer) = self.peers.get_mut(&node) {
            peer.ref_count = peer.ref_count.saturating_sub(1);
        }
    }

    /// Emit an event to the application.
    ///
    /// Overflow is fatal regardless of strict mode: dropping an event would
    /// silently lose committed state.
    pub(super) fn send_event(&self, event: Event) {
        match self.tx_events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                panic!("multiraft: events backlog reached limit");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(?event, "event stream receiver dropped, discarding event");
            }
        }
    }

    /// Panic in strict mode; log an error otherwise.
    pub(super) fn strict_error(&self, msg: String) {
        if self.config.strict {
            panic!("{}", msg);
        }
        tracing::error!("{}", msg);
    }
}

/// Package one write batch covering every dirty group, draining each group's
/// pending entries.
fn take_write_request(groups: &mut HashMap<GroupId, Group>, dirty_groups: &HashSet<GroupId>) -> WriteRequest {
    let mut request = WriteRequest::default();
    for group_id in dirty_groups {
        let Some(group) = groups.get_mut(group_id) else {
            continue;
        };
        let mut group_request = GroupWriteRequest::default();
        if group.persisted_election_state.as_ref() != Some(&group.election_state) {
            group_request.election_state = Some(group.election_state.clone());
        }
        if !group.pending_entries.is_empty() {
            group_request.entries = std::mem::take(&mut group.pending_entries);
        }
        request.groups.insert(*group_id, group_request);
    }
    request
}

/// The per-peer sender: drains the outbound queue sequentially and funnels
/// each response, tagged with its originating request, into the loop's
/// single response channel.
async fn peer_loop<C: Connection>(
    target: NodeId,
    conn: C,
    mut rx: mpsc::UnboundedReceiver<RaftRequest>,
    tx_responses: mpsc::Sender<(RaftRequest, RaftResponse)>,
) {
    while let Some(request) = rx.recv().await {
        match conn.call(request.clone()).await {
            Ok(response) => {
                if tx_responses.send((request, response)).await.is_err() {
                    break;
                }
            }
            // Transient per-RPC failures are not surfaced to group state;
            // replication catches a peer up on a later broadcast.
            Err(err) => tracing::warn!(peer = target, error = %err, "rpc to peer failed"),
        }
    }
    conn.close().await;
    tracing::debug!(peer = target, "peer connection closed");
}
