//! Fixtures for testing multiraft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use memstore::MemStore;
use multiraft::async_trait::async_trait;
use multiraft::raft::RaftRequest;
use multiraft::raft::RaftResponse;
use multiraft::Config;
use multiraft::Connection;
use multiraft::Event;
use multiraft::MessageSink;
use multiraft::MultiRaft;
use multiraft::NodeId;
use multiraft::Transport;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete engine type used during testing.
pub type MemRaft = MultiRaft<MemStore, LocalTransport>;

/// Initialize the tracing system. Safe to call from every test.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Shared in-process routing state: one per test cluster.
pub struct LocalRouter {
    /// The table of registered listeners.
    table: RwLock<BTreeMap<NodeId, MessageSink>>,
    /// Nodes whose outbound frames are dropped.
    blocked: RwLock<HashSet<NodeId>>,
    /// Nodes which refuse new connections.
    unreachable: RwLock<HashSet<NodeId>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(BTreeMap::new()),
            blocked: RwLock::new(HashSet::new()),
            unreachable: RwLock::new(HashSet::new()),
        })
    }

    /// Drop every frame sent by `node` from here on.
    pub async fn block_outbound(&self, node: NodeId) {
        self.blocked.write().await.insert(node);
    }

    /// Deliver `node`'s outbound frames again.
    pub async fn restore_outbound(&self, node: NodeId) {
        self.blocked.write().await.remove(&node);
    }

    /// Make dialing `node` fail.
    pub async fn set_unreachable(&self, node: NodeId) {
        self.unreachable.write().await.insert(node);
    }

    /// The registered listener for `node`, if any. Useful for handing
    /// crafted RPCs directly to an engine.
    pub async fn sink(&self, node: NodeId) -> Option<MessageSink> {
        self.table.read().await.get(&node).cloned()
    }
}

/// The per-node half of the in-process transport.
pub struct LocalTransport {
    node: NodeId,
    router: Arc<LocalRouter>,
}

impl LocalTransport {
    pub fn new(node: NodeId, router: Arc<LocalRouter>) -> Arc<Self> {
        Arc::new(Self { node, router })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    type Conn = LocalConnection;

    async fn listen(&self, local: NodeId, sink: MessageSink) -> Result<()> {
        self.router.table.write().await.insert(local, sink);
        Ok(())
    }

    async fn connect(&self, remote: NodeId) -> Result<LocalConnection> {
        if self.router.unreachable.read().await.contains(&remote) {
            bail!("node {} is unreachable", remote);
        }
        Ok(LocalConnection {
            from: self.node,
            to: remote,
            router: self.router.clone(),
        })
    }

    async fn stop(&self, local: NodeId) {
        self.router.table.write().await.remove(&local);
    }
}

pub struct LocalConnection {
    from: NodeId,
    to: NodeId,
    router: Arc<LocalRouter>,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn call(&self, request: RaftRequest) -> Result<RaftResponse> {
        if self.router.blocked.read().await.contains(&self.from) {
            bail!("node {} is partitioned", self.from);
        }
        let sink = self
            .router
            .sink(self.to)
            .await
            .ok_or_else(|| anyhow!("no listener for node {}", self.to))?;
        Ok(sink.call(request).await?)
    }

    async fn close(&self) {}
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// One engine with its storage and event stream.
pub struct TestNode {
    pub raft: MemRaft,
    pub store: Arc<MemStore>,
    pub events: mpsc::Receiver<Event>,
}

/// A set of engines wired together through one `LocalRouter`.
pub struct Cluster {
    pub router: Arc<LocalRouter>,
    pub nodes: BTreeMap<NodeId, TestNode>,
}

impl Cluster {
    /// Build and start one engine per entry in `configs`.
    pub async fn new(configs: BTreeMap<NodeId, Arc<Config>>) -> Result<Self> {
        init_tracing();
        let router = LocalRouter::new();
        let mut nodes = BTreeMap::new();
        for (id, config) in configs {
            let store = Arc::new(MemStore::new());
            let transport = LocalTransport::new(id, router.clone());
            let raft = MultiRaft::new(id, config, store.clone(), transport).await?;
            raft.start().await;
            let events = raft.event_stream().await.ok_or_else(|| anyhow!("event stream already taken"))?;
            nodes.insert(id, TestNode { raft, store, events });
        }
        Ok(Self { router, nodes })
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes.get(&id).unwrap_or_else(|| panic!("node {} does not exist in this cluster", id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TestNode {
        self.nodes.get_mut(&id).unwrap_or_else(|| panic!("node {} does not exist in this cluster", id))
    }

    /// Stop every engine.
    pub async fn shutdown(self) -> Result<()> {
        for node in self.nodes.values() {
            node.raft.stop().await?;
        }
        Ok(())
    }
}

/// A config which campaigns within `min..max` milliseconds.
pub fn fast_config(min: u64, max: u64) -> Arc<Config> {
    Arc::new(
        Config::build()
            .election_timeout_min(min)
            .election_timeout_max(max)
            .validate()
            .expect("failed to build config"),
    )
}

/// A config whose election timer never fires within a test.
pub fn quiet_config() -> Arc<Config> {
    fast_config(60_000, 120_000)
}

/// The next event on `node`'s stream, or `None` if `within` elapses first.
pub async fn recv_event(node: &mut TestNode, within: Duration) -> Option<Event> {
    tokio::time::timeout(within, node.events.recv()).await.ok().flatten()
}

/// Drain `node`'s stream until an event matches `pred`, failing after `within`.
pub async fn wait_for_event<F>(node: &mut TestNode, within: Duration, mut pred: F) -> Result<Event>
where F: FnMut(&Event) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, node.events.recv()).await {
            Ok(Some(event)) if pred(&event) => return Ok(event),
            Ok(Some(event)) => tracing::debug!(?event, "skipping event while waiting"),
            Ok(None) => bail!("event stream closed while waiting"),
            Err(_) => bail!("timed out after {:?} waiting for event", within),
        }
    }
}
