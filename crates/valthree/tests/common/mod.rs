//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use valthree::client::Client;
use valthree::server::Server;
use valthree::store::{MemStore, ObjectStore};

/// An in-process Valthree cluster: several server nodes sharing one
/// in-memory object store, the same shape as production nodes sharing one
/// bucket.
pub struct Cluster {
    pub addrs: Vec<String>,
    servers: Vec<Arc<Server>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Start `num_servers` nodes over a fresh shared backend.
    pub async fn start(num_servers: usize, max_items: usize) -> Self {
        assert!(num_servers > 0, "num servers must be positive");
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let mut servers = Vec::with_capacity(num_servers);
        let mut addrs = Vec::with_capacity(num_servers);
        let mut tasks = Vec::with_capacity(num_servers);
        for _ in 0..num_servers {
            let server = Arc::new(
                Server::with_store(
                    store.clone(),
                    "valthree",
                    "test",
                    max_items,
                    Duration::from_secs(1),
                )
                .await,
            );
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("listen");
            addrs.push(listener.local_addr().expect("local addr").to_string());
            tasks.push(tokio::spawn({
                let server = server.clone();
                async move {
                    server.serve(listener).await.expect("serve");
                }
            }));
            servers.push(server);
        }
        Self {
            addrs,
            servers,
            tasks,
        }
    }

    /// Connect a ready-to-use client to the `i % nodes`-th node.
    pub async fn client(&self, i: usize) -> Client {
        let addr = &self.addrs[i % self.addrs.len()];
        loop {
            if let Ok(mut client) = Client::dial(addr).await {
                if client.ping().await.is_ok() {
                    return client;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Connect `n` clients, spread across the nodes round-robin.
    pub async fn clients(&self, n: usize) -> Vec<Client> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.client(i).await);
        }
        out
    }

    /// Shut every node down and wait for the accept loops to finish.
    pub async fn shutdown(self) {
        for server in &self.servers {
            server.close();
        }
        for task in self.tasks {
            task.await.expect("server task");
        }
    }
}

/// Start a cluster sized for `num_clients` ready-to-use clients. With more
/// than one client, the cluster has multiple nodes.
pub async fn new_cluster(num_clients: usize) -> (Cluster, Vec<Client>) {
    assert!(num_clients > 0, "num clients must be positive");
    let num_servers = if num_clients > 1 { num_clients / 2 } else { 1 };
    let cluster = Cluster::start(num_servers, 1024).await;
    let clients = cluster.clients(num_clients).await;
    (cluster, clients)
}

/// Send one raw command and render the reply with its RESP type sigil, for
/// asserting on exact wire behavior.
pub async fn raw_command(addr: &str, parts: &[&str]) -> String {
    let socket = TcpStream::connect(addr).await.expect("connect");
    let mut framed = Framed::new(socket, Resp2::default());
    let frame = BytesFrame::Array(
        parts
            .iter()
            .map(|part| BytesFrame::BulkString(Bytes::from(part.as_bytes().to_vec())))
            .collect(),
    );
    framed.send(frame).await.expect("send");
    match framed.next().await.expect("reply").expect("frame") {
        BytesFrame::SimpleString(s) => format!("+{}", String::from_utf8_lossy(&s)),
        BytesFrame::Error(e) => format!("-{}", &*e),
        BytesFrame::Integer(n) => format!(":{n}"),
        BytesFrame::BulkString(b) => format!("${}", String::from_utf8_lossy(&b)),
        BytesFrame::Null => "$-1".to_string(),
        other => format!("{other:?}"),
    }
}
