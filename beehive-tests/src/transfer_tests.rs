//! Cell transfer scenarios: the two-phase drain moves a cell between
//! bees without losing or double-applying anything.

use beehive_core::{AppOptions, Cell};

use crate::apps::test_app;
use crate::harness::{eventually, TestCluster, SETTLE_TIMEOUT};

#[tokio::test]
async fn test_move_cell_to_new_bee() {
    let cluster = TestCluster::start(&[1], || vec![test_app(AppOptions::default())], None);
    let node = &cluster.nodes[0];

    // One bee claims all three grid cells, with some state in them.
    for _ in 0..2 {
        eventually(SETTLE_TIMEOUT, "triple commit", || async {
            node.emit_wait("triple", &b""[..]).await.ok()
        })
        .await;
    }
    assert_eq!(cluster.read_counter("grid", b"c3").await, Some(2));

    let source_bee = {
        let bees = node.list_bees().await.unwrap();
        bees.iter().find(|b| b.cell_count == 3).unwrap().bee
    };

    // Move c3 out through the drain protocol.
    node.move_cells(vec![Cell::new("grid", &b"c3"[..])])
        .await
        .expect("transfer should complete");

    // Ownership split: 2 cells stay, 1 moved to the new bee.
    let bees = node.list_bees().await.unwrap();
    let source = bees.iter().find(|b| b.bee == source_bee).unwrap();
    assert_eq!(source.cell_count, 2);
    let target = bees
        .iter()
        .find(|b| b.bee != source_bee && b.cell_count == 1)
        .expect("moved cell needs a new owner");
    assert_ne!(target.bee, source_bee);

    // The value moved intact, and new messages commit on the new bee.
    eventually(SETTLE_TIMEOUT, "value visible on new owner", || async {
        (cluster.read_counter("grid", b"c3").await == Some(2)).then_some(())
    })
    .await;

    eventually(SETTLE_TIMEOUT, "post-move increment", || async {
        node.emit_wait("grid-one", &b"c3"[..]).await.ok()
    })
    .await;
    assert_eq!(cluster.read_counter("grid", b"c3").await, Some(3));

    // No double-apply on the remaining cells either.
    assert_eq!(cluster.read_counter("grid", b"c1").await, Some(2));
}

#[tokio::test]
async fn test_message_during_drain_lands_after_transfer() {
    let cluster = TestCluster::start(&[1], || vec![test_app(AppOptions::default())], None);
    let node = &cluster.nodes[0];

    eventually(SETTLE_TIMEOUT, "triple commit", || async {
        node.emit_wait("triple", &b""[..]).await.ok()
    })
    .await;

    // Race a message against the transfer. Whichever way the commits
    // interleave, the increment must land exactly once.
    let move_fut = node.move_cells(vec![Cell::new("grid", &b"c3"[..])]);
    let msg_fut = node.emit_wait("grid-one", &b"c3"[..]);
    let (moved, sent) = tokio::join!(move_fut, msg_fut);
    moved.expect("transfer should complete");
    sent.expect("message should commit, possibly after the move");

    eventually(SETTLE_TIMEOUT, "exactly one increment", || async {
        (cluster.read_counter("grid", b"c3").await == Some(2)).then_some(())
    })
    .await;
}
