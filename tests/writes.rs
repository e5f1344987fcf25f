//! Integration tests for writes and write concerns.
//!
//! Covers leader-only acceptance, the three acknowledgment levels, and the
//! failure modes: quorum timeouts when too few members are reachable and
//! lost leadership while a write is waiting.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{fast_timing, TestCluster};
use quorum_kv::config::TimingConfig;
use quorum_kv::error::StoreError;
use quorum_kv::types::{Role, WriteConcern};
use tokio::time::{sleep, Instant};

#[tokio::test]
async fn test_integration_leader_accepts_majority_write() -> Result<()> {
    let cluster = TestCluster::spawn(3, 22101).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;

    let ack = cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await?;
    assert_eq!(ack.index, 1);
    assert_eq!(ack.token, 1);

    // The ack means the entry is committed on the leader.
    let status = cluster.node(1).status().await?;
    assert!(status.commit_index >= ack.index);
    assert_eq!(status.store.get("color"), Some(&"teal".to_string()));

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_followers_reject_writes_with_leader_hint() -> Result<()> {
    let cluster = TestCluster::spawn(3, 22201).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_leader_consensus(1, Duration::from_secs(5))
        .await?;

    let err = cluster
        .node(2)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, StoreError::NotLeader { hint: Some(1) }),
        "got {err:?}"
    );

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_write_concern_one_acks_before_replication() -> Result<()> {
    let cluster = TestCluster::spawn(3, 22301).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;

    let ack = cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::One,
            None,
        )
        .await?;
    assert_eq!(ack.index, 1);

    // The write still replicates in the background and lands everywhere.
    for id in 1..=3 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = cluster.node(id).status().await?;
            if status.store.get("color") == Some(&"teal".to_string()) {
                break;
            }
            if Instant::now() > deadline {
                anyhow::bail!("node {id} never applied the write");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_write_concern_all_waits_for_every_member() -> Result<()> {
    let cluster = TestCluster::spawn(3, 22401).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;

    let ack = cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::All,
            None,
        )
        .await?;

    // An All ack certifies the entry reached every member's log.
    for id in 1..=3 {
        let status = cluster.node(id).status().await?;
        assert!(
            status.last_index >= ack.index,
            "node {id} log is missing the entry"
        );
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_quorum_timeout_when_majority_unreachable() -> Result<()> {
    let timing = TimingConfig {
        operation_deadline: Duration::from_millis(500),
        ..fast_timing()
    };
    let mut cluster = TestCluster::spawn_with_timing(3, 22501, timing).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;
    cluster.stop(2).await;
    cluster.stop(3).await;

    // Majority asks for 2 of 3 but only the leader is alive.
    let err = cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuorumTimeout), "got {err:?}");

    // All is even further out of reach.
    let err = cluster
        .node(1)
        .write(
            "color".to_string(),
            "plum".to_string(),
            WriteConcern::All,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuorumTimeout), "got {err:?}");

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_all_concern_counts_stopped_members() -> Result<()> {
    let timing = TimingConfig {
        operation_deadline: Duration::from_millis(500),
        ..fast_timing()
    };
    let mut cluster = TestCluster::spawn_with_timing(3, 22601, timing).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;
    cluster.stop(3).await;

    // A majority is still reachable, so Majority succeeds while All must
    // time out waiting on the stopped member.
    cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await?;
    let err = cluster
        .node(1)
        .write(
            "color".to_string(),
            "plum".to_string(),
            WriteConcern::All,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::QuorumTimeout), "got {err:?}");

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_lost_leadership_fails_pending_write() -> Result<()> {
    let timing = TimingConfig {
        operation_deadline: Duration::from_secs(5),
        ..fast_timing()
    };
    let mut cluster = TestCluster::spawn_with_timing(3, 22701, timing).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;
    cluster.stop(2).await;
    cluster.stop(3).await;

    // The write suspends waiting for a majority that cannot answer.
    let writer = cluster.node(1).clone();
    let pending = tokio::spawn(async move {
        writer
            .write(
                "color".to_string(),
                "teal".to_string(),
                WriteConcern::Majority,
                None,
            )
            .await
    });
    sleep(Duration::from_millis(300)).await;

    // Campaigning bumps the term, which invalidates the leadership the
    // write was accepted under.
    cluster.node(1).campaign().await?;
    let err = pending.await?.unwrap_err();
    assert!(matches!(err, StoreError::LeadershipLost), "got {err:?}");

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_deposed_leader_rejects_writes_after_rejoin() -> Result<()> {
    let mut cluster = TestCluster::spawn(3, 22901).await?;

    cluster.node(1).campaign().await?;
    cluster
        .wait_for_node_to_become_leader(1, Duration::from_secs(5))
        .await?;
    // A committed entry on the survivors keeps the restarted-empty node from
    // ever out-campaigning them.
    cluster
        .node(1)
        .write(
            "color".to_string(),
            "gray".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await?;
    cluster.stop(1).await;
    let new_leader = cluster.wait_for_single_leader(Duration::from_secs(5)).await?;

    // The old leader rejoins as a follower and must redirect, not accept.
    cluster.restart(1).await?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = cluster.node(1).status().await?;
        if status.role == Role::Follower && status.leader == Some(new_leader as u64) {
            break;
        }
        if Instant::now() > deadline {
            anyhow::bail!("rejoined node never learned the new leader");
        }
        sleep(Duration::from_millis(50)).await;
    }

    let err = cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, StoreError::NotLeader { hint: Some(h) } if h == new_leader as u64),
        "got {err:?}"
    );

    cluster.shutdown().await
}

#[tokio::test]
async fn test_integration_writes_rejected_before_any_election() -> Result<()> {
    // Slow election window: no node can become leader before the write.
    let timing = TimingConfig {
        election_timeout_min: Duration::from_secs(5),
        election_timeout_max: Duration::from_secs(10),
        ..fast_timing()
    };
    let cluster = TestCluster::spawn_with_timing(3, 22801, timing).await?;

    let err = cluster
        .node(1)
        .write(
            "color".to_string(),
            "teal".to_string(),
            WriteConcern::Majority,
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, StoreError::NotLeader { hint: None }),
        "got {err:?}"
    );

    cluster.shutdown().await
}
