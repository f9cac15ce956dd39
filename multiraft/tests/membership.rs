use std::time::Duration;

use anyhow::Result;
use maplit::btreemap;
use maplit::btreeset;
use multiraft::Event;
use multiraft::MembershipChange;

mod fixtures;
use fixtures::fast_config;
use fixtures::quiet_config;
use fixtures::wait_for_event;
use fixtures::Cluster;

const GROUP: u64 = 1;

/// An `AddObserver` change commits like any entry, is announced on the
/// event stream, and brings the observer into the replication fan-out.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_observer_replicates_to_new_node() -> Result<()> {
    let configs = btreemap! {
        1 => fast_config(5, 10),
        2 => quiet_config(),
        4 => quiet_config(),
    };
    let mut cluster = Cluster::new(configs).await?;
    // Node 4 hosts a replica of the group from the start; it only becomes a
    // replication target once the membership change commits.
    for id in [2, 4, 1] {
        cluster.node(id).raft.clone().create_group(GROUP, vec![1, 2]).await?;
    }
    wait_for_event(cluster.node_mut(1), Duration::from_secs(1), |event| {
        matches!(event, Event::LeaderElection { .. })
    })
    .await?;

    cluster
        .node(1)
        .raft
        .change_group_membership(GROUP, MembershipChange::AddObserver, 4)
        .await?;

    let event = wait_for_event(cluster.node_mut(1), Duration::from_secs(1), |event| {
        matches!(event, Event::MembershipChanged { .. })
    })
    .await?;
    match event {
        Event::MembershipChanged { group, members } => {
            assert_eq!(group, GROUP);
            assert_eq!(members.members, btreeset![1, 2]);
            assert_eq!(members.observers, btreeset![4]);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // The follower applies the same change when it commits there.
    wait_for_event(cluster.node_mut(2), Duration::from_secs(1), |event| {
        matches!(event, Event::MembershipChanged { .. })
    })
    .await?;

    // A command submitted after the change reaches the observer.
    cluster.node(1).raft.submit_command(GROUP, b"for-the-observer".to_vec()).await?;
    let event = wait_for_event(cluster.node_mut(4), Duration::from_secs(2), |event| {
        matches!(event, Event::CommandCommitted { .. })
    })
    .await?;
    match event {
        Event::CommandCommitted { payload, .. } => assert_eq!(payload, b"for-the-observer".to_vec()),
        other => panic!("unexpected event: {:?}", other),
    }

    cluster.shutdown().await
}

/// Removing a member shrinks the committed membership on commit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_member_commits() -> Result<()> {
    let configs = btreemap! {
        1 => fast_config(5, 10),
        2 => quiet_config(),
        3 => quiet_config(),
    };
    let mut cluster = Cluster::new(configs).await?;
    for id in [2, 3, 1] {
        cluster.node(id).raft.clone().create_group(GROUP, vec![1, 2, 3]).await?;
    }
    wait_for_event(cluster.node_mut(1), Duration::from_secs(1), |event| {
        matches!(event, Event::LeaderElection { .. })
    })
    .await?;

    cluster
        .node(1)
        .raft
        .change_group_membership(GROUP, MembershipChange::RemoveMember, 3)
        .await?;

    let event = wait_for_event(cluster.node_mut(1), Duration::from_secs(1), |event| {
        matches!(event, Event::MembershipChanged { .. })
    })
    .await?;
    match event {
        Event::MembershipChanged { members, .. } => {
            assert_eq!(members.members, btreeset![1, 2]);
            assert!(members.observers.is_empty());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    cluster.shutdown().await
}
