//! Multi-node scenarios: claim conflicts, forwarding, and leader
//! failover.

use beehive_core::{AppOptions, Persistence};
use tempfile::TempDir;

use crate::apps::test_app;
use crate::harness::{emit_until_committed, eventually, TestCluster, SETTLE_TIMEOUT};

#[tokio::test]
async fn test_concurrent_claims_resolve_to_one_bee() {
    let cluster = TestCluster::start(
        &[1, 2],
        || vec![test_app(AppOptions::default())],
        None,
    );

    // Both nodes race for the same unowned cell. Exactly one claim
    // commits; the loser re-routes and forwards. Both messages apply.
    tokio::join!(
        emit_until_committed(&cluster.nodes[0], "hello", b"contested"),
        emit_until_committed(&cluster.nodes[1], "hello", b"contested"),
    );

    eventually(SETTLE_TIMEOUT, "both applied", || async {
        (cluster.read_counter("hello", b"contested").await == Some(2)).then_some(())
    })
    .await;

    // One winning bee owns the cell on every node's view.
    let bees = cluster.nodes[0].list_bees().await.unwrap();
    let owning: Vec<_> = bees.iter().filter(|b| b.cell_count > 0).collect();
    assert_eq!(owning.len(), 1, "exactly one claim may win: {bees:?}");
}

#[tokio::test]
async fn test_remote_messages_forward_to_owner() {
    let cluster = TestCluster::start(
        &[1, 2, 3],
        || vec![test_app(AppOptions::default())],
        None,
    );

    // Claim through node 1, then hit the same key from the others.
    emit_until_committed(&cluster.nodes[0], "hello", b"routed").await;
    emit_until_committed(&cluster.nodes[1], "hello", b"routed").await;
    emit_until_committed(&cluster.nodes[2], "hello", b"routed").await;

    eventually(SETTLE_TIMEOUT, "all forwarded and applied", || async {
        (cluster.read_counter("hello", b"routed").await == Some(3)).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_leader_failover_preserves_counter() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let dir_paths: Vec<_> = dirs.iter().map(|d| d.path().to_path_buf()).collect();

    let cluster = TestCluster::start(
        &[1, 2, 3],
        || {
            vec![test_app(
                AppOptions::default()
                    .with_persistence(Persistence::Log)
                    .with_replication(3),
            )]
        },
        Some(&dir_paths),
    );

    // Seed the bee through node 1 and wait for its colony to replicate.
    emit_until_committed(&cluster.nodes[0], "hello", b"survivor").await;
    eventually(SETTLE_TIMEOUT, "colony replicated", || async {
        let bees = cluster.nodes[0].list_bees().await.ok()?;
        bees.iter()
            .any(|b| b.cell_count > 0 && b.colony.len() == 3)
            .then_some(())
    })
    .await;

    // First half of the workload.
    for _ in 0..10 {
        emit_until_committed(&cluster.nodes[0], "hello", b"survivor").await;
    }

    // Kill the colony leader.
    let leader = {
        let bees = cluster.nodes[0].list_bees().await.unwrap();
        bees.iter()
            .find(|b| b.cell_count > 0)
            .and_then(|b| b.colony.first().copied())
            .expect("bee must have a leader")
    };
    cluster.kill(leader);

    // The rest of the workload goes through a surviving node; retries
    // ride out the re-election.
    let survivor = cluster
        .nodes
        .iter()
        .find(|n| n.node_id != leader)
        .expect("two nodes survive");
    for _ in 0..10 {
        emit_until_committed(survivor, "hello", b"survivor").await;
    }

    // Every committed increment is present exactly once: the seed plus
    // both halves of the workload.
    eventually(SETTLE_TIMEOUT, "final count", || async {
        (cluster.read_counter("hello", b"survivor").await == Some(21)).then_some(())
    })
    .await;
}
