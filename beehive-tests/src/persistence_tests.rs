//! Restart persistence: a clean stop and restart reloads dictionaries
//! and continues counting where it left off.

use beehive_core::{AppOptions, Persistence};
use tempfile::TempDir;

use crate::apps::test_app;
use crate::harness::{eventually, TestCluster, SETTLE_TIMEOUT};

fn persistent_app() -> Vec<beehive_runtime::App> {
    vec![test_app(
        AppOptions::default().with_persistence(Persistence::Log),
    )]
}

#[tokio::test]
async fn test_restart_reloads_dictionaries() {
    let dir = TempDir::new().unwrap();
    let dir_path = vec![dir.path().to_path_buf()];

    // First life: increment X three times, stop cleanly.
    {
        let cluster = TestCluster::start(&[1], persistent_app, Some(&dir_path));
        let node = &cluster.nodes[0];
        for _ in 0..3 {
            eventually(SETTLE_TIMEOUT, "increment", || async {
                node.emit_wait("hello", &b"X"[..]).await.ok()
            })
            .await;
        }
        assert_eq!(cluster.read_counter("hello", b"X").await, Some(3));
        node.shutdown().await;
        cluster.net.disconnect(node.node_id);
    }

    // Second life: the dictionary is back, and the next increment lands
    // on top of it.
    let cluster = TestCluster::start(&[1], persistent_app, Some(&dir_path));
    let node = &cluster.nodes[0];

    eventually(SETTLE_TIMEOUT, "state reloaded", || async {
        (cluster.read_counter("hello", b"X").await == Some(3)).then_some(())
    })
    .await;

    eventually(SETTLE_TIMEOUT, "post-restart increment", || async {
        node.emit_wait("hello", &b"X"[..]).await.ok()
    })
    .await;
    assert_eq!(cluster.read_counter("hello", b"X").await, Some(4));
}

#[tokio::test]
async fn test_restart_preserves_bee_identity() {
    let dir = TempDir::new().unwrap();
    let dir_path = vec![dir.path().to_path_buf()];

    let first_bee = {
        let cluster = TestCluster::start(&[1], persistent_app, Some(&dir_path));
        let node = &cluster.nodes[0];
        eventually(SETTLE_TIMEOUT, "claim", || async {
            node.emit_wait("hello", &b"id"[..]).await.ok()
        })
        .await;
        let bees = node.list_bees().await.unwrap();
        let bee = bees.iter().find(|b| b.cell_count > 0).unwrap().bee;
        node.shutdown().await;
        cluster.net.disconnect(node.node_id);
        bee
    };

    let cluster = TestCluster::start(&[1], persistent_app, Some(&dir_path));
    let node = &cluster.nodes[0];

    // The registry reloads the same bee; a new message routes to it
    // instead of claiming a fresh one.
    eventually(SETTLE_TIMEOUT, "re-route to recovered bee", || async {
        node.emit_wait("hello", &b"id"[..]).await.ok()
    })
    .await;

    let bees = node.list_bees().await.unwrap();
    let owning: Vec<_> = bees.iter().filter(|b| b.cell_count > 0).collect();
    assert_eq!(owning.len(), 1);
    assert_eq!(owning[0].bee, first_bee);
    assert_eq!(cluster.read_counter("hello", b"id").await, Some(2));
}
