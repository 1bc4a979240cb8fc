//! Single-node scenarios: the hello counter, split rejection, and the
//! emit chain.

use beehive_core::{AppOptions, HiveError};

use crate::apps::test_app;
use crate::harness::{eventually, TestCluster, SETTLE_TIMEOUT};

fn one_node() -> TestCluster {
    TestCluster::start(&[1], || vec![test_app(AppOptions::default())], None)
}

#[tokio::test]
async fn test_hello_counter() {
    let cluster = one_node();
    let node = &cluster.nodes[0];

    // Three As, two Bs.
    for _ in 0..3 {
        eventually(SETTLE_TIMEOUT, "A commit", || async {
            node.emit_wait("hello", &b"A"[..]).await.ok()
        })
        .await;
    }
    for _ in 0..2 {
        eventually(SETTLE_TIMEOUT, "B commit", || async {
            node.emit_wait("hello", &b"B"[..]).await.ok()
        })
        .await;
    }

    assert_eq!(cluster.read_counter("hello", b"A").await, Some(3));
    assert_eq!(cluster.read_counter("hello", b"B").await, Some(2));

    // Separate claims committed: A and B live in different bees.
    let bees = node.list_bees().await.unwrap();
    let owning: Vec<_> = bees.iter().filter(|b| b.cell_count > 0).collect();
    assert_eq!(owning.len(), 2, "expected one bee per key, got {bees:?}");
    assert_ne!(owning[0].bee, owning[1].bee);
}

#[tokio::test]
async fn test_split_cells_rejected() {
    let cluster = one_node();
    let node = &cluster.nodes[0];

    // Establish separate owners for k1 and k2.
    eventually(SETTLE_TIMEOUT, "k1 commit", || async {
        node.emit_wait("hello", &b"k1"[..]).await.ok()
    })
    .await;
    eventually(SETTLE_TIMEOUT, "k2 commit", || async {
        node.emit_wait("hello", &b"k2"[..]).await.ok()
    })
    .await;

    // A message mapping both must be rejected, not silently split.
    let result = node.emit_wait("pair", &b"k1,k2"[..]).await;
    assert!(
        matches!(result, Err(HiveError::SplitCells { ref owners }) if owners.len() == 2),
        "expected split rejection, got {result:?}"
    );

    // And nothing changed.
    assert_eq!(cluster.read_counter("hello", b"k1").await, Some(1));
    assert_eq!(cluster.read_counter("hello", b"k2").await, Some(1));
}

#[tokio::test]
async fn test_pair_claims_both_cells_when_unowned() {
    let cluster = one_node();
    let node = &cluster.nodes[0];

    // Unowned pair: one claim binds both cells to one bee, and later
    // singles route to it.
    eventually(SETTLE_TIMEOUT, "pair commit", || async {
        node.emit_wait("pair", &b"x,y"[..]).await.ok()
    })
    .await;
    eventually(SETTLE_TIMEOUT, "x commit", || async {
        node.emit_wait("hello", &b"x"[..]).await.ok()
    })
    .await;

    assert_eq!(cluster.read_counter("hello", b"x").await, Some(2));
    assert_eq!(cluster.read_counter("hello", b"y").await, Some(1));

    let bees = node.list_bees().await.unwrap();
    let owning: Vec<_> = bees.iter().filter(|b| b.cell_count > 0).collect();
    assert_eq!(owning.len(), 1);
    assert_eq!(owning[0].cell_count, 2);
}

#[tokio::test]
async fn test_emit_chain() {
    let cluster = one_node();
    let node = &cluster.nodes[0];

    // One injected message plus five re-emits: six increments in all.
    eventually(SETTLE_TIMEOUT, "chain head commit", || async {
        node.emit_wait("chain", &[5u8][..]).await.ok()
    })
    .await;

    eventually(SETTLE_TIMEOUT, "chain drained", || async {
        (cluster.read_counter("chain", b"total").await == Some(6)).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_unknown_type_tag_surfaces() {
    let cluster = one_node();
    let node = &cluster.nodes[0];

    let result = node.emit_wait("no-such-tag", &b"x"[..]).await;
    assert!(matches!(result, Err(HiveError::NotFound { .. })));
}
