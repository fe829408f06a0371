//! The Valthree node server: accepts Valkey connections and dispatches
//! commands against the storage engine.

use std::sync::Arc;
use std::time::Duration;

use antithesis_sdk::assert_unreachable;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::op::Op;
use crate::storage::Storage;
use crate::store::{ObjectStore, S3Store};

/// Primitive values that configure a Valthree server.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_name: String,
    pub max_items: usize,

    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_user: String,
    pub s3_password: String,
    pub s3_timeout: Duration,
}

/// A Valthree server node. Nodes are stateless: every node serving the same
/// bucket and database name exposes the same data.
pub struct Server {
    max_items: usize,
    storage: Arc<Storage>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Construct a server against an S3-compatible endpoint.
    ///
    /// Before returning, ensures that the object-storage bucket is created
    /// and ready to use; under adversarial conditions, this retries bucket
    /// creation indefinitely.
    pub async fn new(cfg: Config) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(
            &cfg.s3_endpoint,
            &cfg.s3_region,
            &cfg.s3_user,
            &cfg.s3_password,
        ));
        Self::with_store(
            store,
            &cfg.s3_bucket,
            &cfg.database_name,
            cfg.max_items,
            cfg.s3_timeout,
        )
        .await
    }

    /// Construct a server over an arbitrary object store. Same bucket
    /// bootstrap as `new`.
    pub async fn with_store(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        database_name: &str,
        max_items: usize,
        timeout: Duration,
    ) -> Self {
        let storage = Arc::new(Storage::new(store, bucket, database_name, timeout));
        loop {
            match storage.ensure_bucket_exists().await {
                Ok(()) => {
                    tracing::info!(bucket, "bucket ready");
                    break;
                }
                Err(err) => {
                    let backoff = Duration::from_secs(1);
                    tracing::error!(bucket, error = %err, retry_after = ?backoff, "bucket not ready");
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        let (shutdown, _) = watch::channel(false);
        Self {
            max_items,
            storage,
            shutdown,
        }
    }

    /// Accept connections and serve Valkey requests until `close` is called.
    /// In-flight handlers are allowed to finish naturally.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                res = listener.accept() => {
                    let (socket, _) = res?;
                    let storage = self.storage.clone();
                    let max_items = self.max_items;
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(socket, storage, max_items).await {
                            tracing::debug!(error = ?err, "connection closed");
                        }
                    });
                }
            }
        }
    }

    /// Shut the server down. Idempotent, and safe to call before `serve`.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// One decoded client request.
#[derive(Debug)]
struct Request {
    name: String,
    args: Vec<String>,
}

async fn handle_conn(
    socket: TcpStream,
    storage: Arc<Storage>,
    max_items: usize,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let request = match parse_command(frame) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(err) => {
                framed
                    .send(BytesFrame::Error(format!("ERR {err}").into()))
                    .await?;
                continue;
            }
        };

        let (reply, quit) = match Op::parse(&request.name) {
            Some(op) => execute(op, &request.args, &storage, max_items).await,
            None => (
                BytesFrame::Error(format!("ERR unknown command '{}'", request.name).into()),
                false,
            ),
        };
        framed.send(reply).await?;
        if quit {
            break;
        }
    }
    Ok(())
}

async fn execute(
    op: Op,
    args: &[String],
    storage: &Storage,
    max_items: usize,
) -> (BytesFrame, bool) {
    match op {
        Op::Get => (get(storage, args).await, false),
        Op::Set => (set(storage, max_items, args).await, false),
        Op::Del => (del(storage, args).await, false),
        Op::FlushAll => (flush_all(storage, args).await, false),
        Op::Ping => {
            if !args.is_empty() {
                (arity_error(Op::Ping), false)
            } else {
                (BytesFrame::SimpleString(Bytes::from_static(b"PONG")), false)
            }
        }
        Op::Quit => {
            if !args.is_empty() {
                (arity_error(Op::Quit), false)
            } else {
                (ok_reply(), true)
            }
        }
    }
}

async fn get(storage: &Storage, args: &[String]) -> BytesFrame {
    if args.len() != 1 {
        return arity_error(Op::Get);
    }
    let items = match storage.get_db().await {
        Ok(items) => items,
        Err(err) => return error_reply(&err),
    };
    match items.get(&args[0]) {
        None => BytesFrame::Null,
        Some(val) if val.is_empty() => {
            // See set: explicitly storing empty values is forbidden.
            assert_unreachable!("Stored values are never empty", &json!({ "key": args[0] }));
            BytesFrame::Error(
                format!("ERR database contains empty value for string {}", args[0]).into(),
            )
        }
        Some(val) => BytesFrame::BulkString(Bytes::from(val.clone().into_bytes())),
    }
}

async fn set(storage: &Storage, max_items: usize, args: &[String]) -> BytesFrame {
    if args.len() != 2 {
        return arity_error(Op::Set);
    }
    // Valkey allows SET with an empty value, but the empty string is reserved
    // as the absent-key sentinel in the consistency model.
    if args[1].is_empty() {
        return BytesFrame::Error("ERR empty value".into());
    }

    let key = args[0].clone();
    let value = args[1].clone();
    let res = storage
        .mutate_db(move |items| {
            // Refuses at capacity even when overwriting an existing key.
            if items.len() >= max_items {
                anyhow::bail!("at max capacity of {max_items} keys");
            }
            items.insert(key.clone(), value.clone());
            Ok(0)
        })
        .await;
    match res {
        Ok(_) => ok_reply(),
        Err(err) => error_reply(&err),
    }
}

async fn del(storage: &Storage, args: &[String]) -> BytesFrame {
    // Valkey allows multi-key DEL, but single-key DEL keeps the per-key
    // registers independent.
    if args.len() != 1 {
        return arity_error(Op::Del);
    }
    let key = args[0].clone();
    let res = storage
        .mutate_db(move |items| Ok(if items.remove(&key).is_some() { 1 } else { 0 }))
        .await;
    match res {
        Ok(n) => BytesFrame::Integer(n),
        Err(err) => error_reply(&err),
    }
}

async fn flush_all(storage: &Storage, args: &[String]) -> BytesFrame {
    if !args.is_empty() {
        return arity_error(Op::FlushAll);
    }
    let res = storage
        .mutate_db(|items| {
            items.clear();
            Ok(0)
        })
        .await;
    match res {
        Ok(_) => ok_reply(),
        Err(err) => error_reply(&err),
    }
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<Request>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    if parts.is_empty() {
        return Ok(None);
    }

    let name = frame_str(&parts[0])
        .ok_or_else(|| anyhow::anyhow!("invalid command"))?
        .to_ascii_lowercase();
    let mut args = Vec::with_capacity(parts.len() - 1);
    for part in &parts[1..] {
        args.push(frame_str(part).ok_or_else(|| anyhow::anyhow!("invalid argument"))?);
    }
    Ok(Some(Request { name, args }))
}

fn frame_str(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            Some(String::from_utf8_lossy(b).into_owned())
        }
        _ => None,
    }
}

fn ok_reply() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

fn arity_error(op: Op) -> BytesFrame {
    BytesFrame::Error(format!("ERR wrong number of arguments for '{op}' command").into())
}

fn error_reply(err: &anyhow::Error) -> BytesFrame {
    BytesFrame::Error(format!("ERR {err}").into())
}
