use std::time::Duration;

use anyhow::Result;
use maplit::btreemap;
use multiraft::Event;
use multiraft::SubmitError;

mod fixtures;
use fixtures::fast_config;
use fixtures::quiet_config;
use fixtures::wait_for_event;
use fixtures::Cluster;

const GROUP: u64 = 1;

/// Build a three-node cluster where node 1 is the only node with a live
/// election timer, and wait for it to take the group.
async fn three_node_cluster_with_leader() -> Result<Cluster> {
    let configs = btreemap! {
        1 => fast_config(5, 10),
        2 => quiet_config(),
        3 => quiet_config(),
    };
    let mut cluster = Cluster::new(configs).await?;
    // Install the group on the quiet nodes first so node 1's first campaign
    // finds every voter ready.
    for id in [2, 3, 1] {
        cluster.node(id).raft.clone().create_group(GROUP, vec![1, 2, 3]).await?;
    }
    wait_for_event(cluster.node_mut(1), Duration::from_secs(1), |event| {
        matches!(event, Event::LeaderElection { .. })
    })
    .await?;
    Ok(cluster)
}

/// A committed command is observable on every node, leader and followers alike.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn command_commits_on_all_nodes() -> Result<()> {
    let mut cluster = three_node_cluster_with_leader().await?;

    cluster.node(1).raft.submit_command(GROUP, b"x".to_vec()).await?;

    for id in [1, 2, 3] {
        let event = wait_for_event(cluster.node_mut(id), Duration::from_secs(1), |event| {
            matches!(event, Event::CommandCommitted { .. })
        })
        .await?;
        assert_eq!(
            event,
            Event::CommandCommitted {
                group: GROUP,
                index: 1,
                payload: b"x".to_vec(),
            },
            "node {} saw the wrong commit",
            id
        );
    }

    cluster.shutdown().await
}

/// Back-to-back submissions commit in submission order, with consecutive
/// indexes, on every node, even while earlier batches are still in the
/// write pipeline.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_order_is_preserved_under_pipelining() -> Result<()> {
    let mut cluster = three_node_cluster_with_leader().await?;
    let raft = cluster.node(1).raft.clone();

    for payload in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
        raft.submit_command(GROUP, payload).await?;
    }

    for id in [1, 2, 3] {
        let mut commits = Vec::new();
        while commits.len() < 3 {
            let event = wait_for_event(cluster.node_mut(id), Duration::from_secs(1), |event| {
                matches!(event, Event::CommandCommitted { .. })
            })
            .await?;
            if let Event::CommandCommitted { index, payload, .. } = event {
                commits.push((index, payload));
            }
        }
        assert_eq!(
            commits,
            vec![(1, b"a".to_vec()), (2, b"b".to_vec()), (3, b"c".to_vec())],
            "node {} committed out of order",
            id
        );
    }

    cluster.shutdown().await
}

/// Submitting to a follower fails with `NotLeader`; submitting to a group
/// the node does not host fails with `GroupNotFound`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_errors() -> Result<()> {
    let cluster = three_node_cluster_with_leader().await?;

    let res = cluster.node(2).raft.submit_command(GROUP, b"x".to_vec()).await;
    assert!(matches!(res, Err(SubmitError::NotLeader(g)) if g == GROUP), "got {:?}", res);

    let res = cluster.node(1).raft.submit_command(99, b"x".to_vec()).await;
    assert!(matches!(res, Err(SubmitError::GroupNotFound(99))), "got {:?}", res);

    cluster.shutdown().await
}
