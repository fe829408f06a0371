//! Multi-node integration tests: cross-node visibility and write races.

mod common;

use std::sync::Arc;

use tokio::sync::Barrier;

use common::Cluster;
use valthree::client::Error;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_are_visible_across_nodes() {
    let cluster = Cluster::start(2, 1024).await;
    let mut c0 = cluster.client(0).await;
    let mut c1 = cluster.client(1).await;

    c0.set("foo", "bar").await.expect("set on node 0");
    assert_eq!(c1.get("foo").await.expect("get on node 1"), "bar");

    c1.del("foo").await.expect("del on node 1");
    assert_eq!(c0.get("foo").await, Err(Error::NotFound));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sets_have_one_winner() {
    let cluster = Cluster::start(2, 1024).await;
    let c0 = cluster.client(0).await;
    let c1 = cluster.client(1).await;

    let barrier = Arc::new(Barrier::new(2));
    let t0 = tokio::spawn({
        let barrier = barrier.clone();
        let mut c0 = c0;
        async move {
            barrier.wait().await;
            c0.set("foo", "A").await.expect("set A");
            c0
        }
    });
    let t1 = tokio::spawn({
        let barrier = barrier.clone();
        let mut c1 = c1;
        async move {
            barrier.wait().await;
            c1.set("foo", "B").await.expect("set B");
            c1
        }
    });
    let mut c0 = t0.await.expect("set task");
    let mut c1 = t1.await.expect("set task");

    // Both SETs succeeded; with no further writers, every node agrees on a
    // single winner.
    let v0 = c0.get("foo").await.expect("get on node 0");
    let v1 = c1.get("foo").await.expect("get on node 1");
    assert!(v0 == "A" || v0 == "B", "unexpected value {v0:?}");
    assert_eq!(v0, v1);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flushall_empties_every_node() {
    let cluster = Cluster::start(2, 1024).await;
    let mut c0 = cluster.client(0).await;
    let mut c1 = cluster.client(1).await;

    let keys = ["k0", "k1", "k2", "k3", "k4"];
    for (i, key) in keys.iter().enumerate() {
        let c = if i % 2 == 0 { &mut c0 } else { &mut c1 };
        c.set(key, "v").await.expect("set");
    }

    c1.flush_all().await.expect("flushall");
    for key in &keys {
        assert_eq!(c0.get(key).await, Err(Error::NotFound), "{key} on node 0");
        assert_eq!(c1.get(key).await, Err(Error::NotFound), "{key} on node 1");
    }

    // A flushed database accepts new writes.
    c0.set("k0", "again").await.expect("set after flush");
    assert_eq!(c1.get("k0").await.expect("get"), "again");

    cluster.shutdown().await;
}
