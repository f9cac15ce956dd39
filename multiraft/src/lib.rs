//! A multi-group Raft consensus engine.
//!
//! Running N independent Raft instances multiplies heartbeats, timers and
//! write fsyncs by N. This crate multiplexes every consensus group hosted on
//! a node through one event loop, one asynchronous write pipeline and one
//! connection per remote peer, amortizing those costs across groups.
//!
//! The engine is deliberately storage- and transport-agnostic: applications
//! provide a [`Storage`] implementation for durably recording election state
//! and log entries, and a [`Transport`] implementation for moving typed
//! request/response messages between nodes. Committed commands and
//! membership changes flow back to the application on a bounded, in-order
//! [`Event`] stream.

pub mod clock;
pub mod config;
mod core;
pub mod error;
pub mod event;
pub mod network;
pub mod raft;
pub mod storage;

pub use async_trait;

pub use crate::clock::Clock;
pub use crate::clock::WallClock;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::Role;
pub use crate::error::ConfigError;
pub use crate::error::CreateGroupError;
pub use crate::error::MultiRaftError;
pub use crate::error::SubmitError;
pub use crate::event::Event;
pub use crate::network::Connection;
pub use crate::network::MessageSink;
pub use crate::network::Transport;
pub use crate::raft::GroupMembers;
pub use crate::raft::LogEntry;
pub use crate::raft::LogEntryKind;
pub use crate::raft::MembershipChange;
pub use crate::raft::MultiRaft;
pub use crate::storage::ElectionState;
pub use crate::storage::Storage;

/// A node's unique, non-zero identifier within the cluster.
///
/// Zero is reserved as "unset".
pub type NodeId = u32;

/// A consensus group's unique identifier within the node.
pub type GroupId = u64;

/// A monotonically non-decreasing election epoch, per group.
pub type Term = u64;

/// A 1-based, monotonically increasing log position, per group.
pub type LogIndex = u64;
