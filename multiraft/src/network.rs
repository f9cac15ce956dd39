//! The network interface between cluster nodes.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use crate::error::MultiRaftError;
use crate::raft::RaftReplyTx;
use crate::raft::RaftRequest;
use crate::raft::RaftResponse;
use crate::NodeId;

/// A trait defining the interface for delivering typed request/response
/// messages between nodes.
///
/// The engine registers itself as the handler for inbound messages via
/// [`listen`](Transport::listen), dials one [`Connection`] per remote peer it
/// shares a group with, and tears everything down with
/// [`stop`](Transport::stop). Serialization of messages on the wire is
/// entirely the transport's business.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by `connect`.
    type Conn: Connection;

    /// Register `sink` as the handler for messages addressed to `local`.
    async fn listen(&self, local: NodeId, sink: MessageSink) -> Result<()>;

    /// Open a bidirectional message channel to `remote`.
    ///
    /// Dialing the local node must be supported; the engine uses the same
    /// code path for messages to itself as for remote peers.
    async fn connect(&self, remote: NodeId) -> Result<Self::Conn>;

    /// Stop delivering messages to `local` and release its listener.
    async fn stop(&self, local: NodeId);
}

/// One direction of a bidirectional message channel to a peer.
///
/// `call` carries a request to the peer and resolves with the peer's
/// response. The engine issues calls sequentially per peer, so transports
/// need not handle concurrent calls on one connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Deliver `request` to the remote node and await its response.
    async fn call(&self, request: RaftRequest) -> Result<RaftResponse>;

    /// Close the channel.
    async fn close(&self);
}

/// An inbound RPC together with the handle used to answer it.
pub(crate) struct InboundCall {
    pub(crate) request: RaftRequest,
    pub(crate) tx: RaftReplyTx,
}

/// The engine-side handler for inbound messages.
///
/// A `MessageSink` is handed to [`Transport::listen`] when the engine is
/// constructed. It holds only a channel into the event loop, so transports
/// keeping one alive do not keep the engine alive.
///
/// Intake is bounded. A full channel indicates the loop is not keeping up:
/// in strict mode that is fatal, otherwise the send falls back to blocking.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<InboundCall>,
    strict: bool,
}

impl MessageSink {
    pub(crate) fn new(tx: mpsc::Sender<InboundCall>, strict: bool) -> Self {
        Self { tx, strict }
    }

    /// Deliver an inbound request to the engine and await its response.
    ///
    /// The response may be withheld until the state changes implied by the
    /// request are durable on this node.
    pub async fn call(&self, request: RaftRequest) -> Result<RaftResponse, MultiRaftError> {
        let (tx, rx) = oneshot::channel();
        let call = InboundCall { request, tx };
        match self.tx.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                if self.strict {
                    panic!("multiraft: rpc request channel blocked");
                }
                tracing::error!("rpc request channel blocked, falling back to blocking send");
                self.tx.send(call).await.map_err(|_| MultiRaftError::ShuttingDown)?;
            }
            Err(TrySendError::Closed(_)) => return Err(MultiRaftError::ShuttingDown),
        }
        rx.await.map_err(|_| MultiRaftError::ShuttingDown)?
    }
}
