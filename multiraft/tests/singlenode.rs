use std::time::Duration;

use anyhow::Result;
use maplit::btreemap;
use multiraft::Event;

mod fixtures;
use fixtures::fast_config;
use fixtures::wait_for_event;
use fixtures::Cluster;

/// Single-node group election and commit.
///
/// What does this test do?
///
/// - brings one engine online hosting a group whose only member is itself.
/// - asserts that the group elects this node within a few election timeouts.
/// - submits a command and asserts it commits without any peer traffic.
///
/// RUST_LOG=multiraft,memstore,singlenode=trace cargo test -p multiraft --test singlenode
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn singlenode() -> Result<()> {
    let mut cluster = Cluster::new(btreemap! {1 => fast_config(1, 2)}).await?;
    let raft = cluster.node(1).raft.clone();
    raft.create_group(10, vec![1]).await?;

    let event = wait_for_event(cluster.node_mut(1), Duration::from_millis(100), |event| {
        matches!(event, Event::LeaderElection { .. })
    })
    .await?;
    assert_eq!(event, Event::LeaderElection { group: 10, leader: 1 });

    raft.submit_command(10, b"set x=1".to_vec()).await?;
    let event = wait_for_event(cluster.node_mut(1), Duration::from_millis(100), |event| {
        matches!(event, Event::CommandCommitted { .. })
    })
    .await?;
    assert_eq!(
        event,
        Event::CommandCommitted {
            group: 10,
            index: 1,
            payload: b"set x=1".to_vec(),
        }
    );

    // The command is durable, not just emitted.
    assert_eq!(cluster.node(1).store.last_index(10).await, Some(1));

    cluster.shutdown().await
}

/// One engine hosting several single-member groups: each elects and commits
/// independently while sharing the loop and write pipeline.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn singlenode_many_groups() -> Result<()> {
    let mut cluster = Cluster::new(btreemap! {1 => fast_config(1, 2)}).await?;
    let raft = cluster.node(1).raft.clone();
    for group in [1, 2, 3] {
        raft.create_group(group, vec![1]).await?;
    }

    let mut elected = std::collections::BTreeSet::new();
    while elected.len() < 3 {
        let event = wait_for_event(cluster.node_mut(1), Duration::from_millis(200), |event| {
            matches!(event, Event::LeaderElection { .. })
        })
        .await?;
        if let Event::LeaderElection { group, leader } = event {
            assert_eq!(leader, 1);
            elected.insert(group);
        }
    }

    for group in [1, 2, 3] {
        raft.submit_command(group, format!("cmd-{}", group).into_bytes()).await?;
    }
    let mut committed = std::collections::BTreeSet::new();
    while committed.len() < 3 {
        let event = wait_for_event(cluster.node_mut(1), Duration::from_millis(200), |event| {
            matches!(event, Event::CommandCommitted { .. })
        })
        .await?;
        if let Event::CommandCommitted { group, index, payload } = event {
            assert_eq!(index, 1);
            assert_eq!(payload, format!("cmd-{}", group).into_bytes());
            committed.insert(group);
        }
    }

    cluster.shutdown().await
}
