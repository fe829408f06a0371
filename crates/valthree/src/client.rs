//! A typed client for Valthree servers.
//!
//! The client wraps one connection and decodes each reply into the shape the
//! command promises. It is deliberately less flexible than a generic Valkey
//! client, but it introduces far less noise in tests and workloads.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Errors returned by the typed client. `NotFound` is the only variant that
/// signals a well-defined negative outcome; everything else leaves the
/// operation's effect uncertain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The key used in a GET or DEL command was not present in the database.
    #[error("key not found")]
    NotFound,
    /// The connection saw a transport error earlier and is permanently
    /// unusable.
    #[error("conn unusable: {0}")]
    Unusable(String),
    /// The server replied with an error.
    #[error("{0}")]
    Server(String),
    /// The server replied with a frame the command does not allow.
    #[error("{0}")]
    Protocol(String),
    /// The transport failed during this call; subsequent calls will report
    /// the connection as unusable.
    #[error("{0}")]
    Transport(String),
}

/// A single-connection client. Not safe for concurrent use; workloads give
/// each task its own client.
pub struct Client {
    framed: Framed<TcpStream, Resp2>,
    conn_err: Option<String>,
}

impl Client {
    /// Connect to a Valthree server.
    pub async fn dial(addr: &str) -> Result<Self, Error> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::Transport(format!("dial: {err}")))?;
        socket.set_nodelay(true).ok();
        Ok(Self {
            framed: Framed::new(socket, Resp2::default()),
            conn_err: None,
        })
    }

    /// Ping the database.
    pub async fn ping(&mut self) -> Result<(), Error> {
        match self.do_request(command(&["PING"])).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
            BytesFrame::Error(msg) => Err(Error::Server(msg.to_string())),
            other => Err(Error::Protocol(format!(
                "unexpected ping response: {other:?}"
            ))),
        }
    }

    /// Get the value of a single key.
    pub async fn get(&mut self, key: &str) -> Result<String, Error> {
        match self.do_request(command(&["GET", key])).await? {
            BytesFrame::Null => Err(Error::NotFound),
            BytesFrame::BulkString(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            BytesFrame::Error(msg) => Err(Error::Server(msg.to_string())),
            other => Err(Error::Protocol(format!(
                "unexpected get response: {other:?}"
            ))),
        }
    }

    /// Set the value of a single key.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match self.do_request(command(&["SET", key, value])).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            BytesFrame::Error(msg) => Err(Error::Server(msg.to_string())),
            other => Err(Error::Protocol(format!(
                "unexpected set response: {other:?}"
            ))),
        }
    }

    /// Delete a key. This client restricts DEL to a single key.
    pub async fn del(&mut self, key: &str) -> Result<(), Error> {
        match self.do_request(command(&["DEL", key])).await? {
            BytesFrame::Integer(0) => Err(Error::NotFound),
            BytesFrame::Integer(1) => Ok(()),
            BytesFrame::Integer(n) => Err(Error::Protocol(format!(
                "server returned {n} for single-key DEL"
            ))),
            BytesFrame::Error(msg) => Err(Error::Server(msg.to_string())),
            other => Err(Error::Protocol(format!(
                "unexpected del response: {other:?}"
            ))),
        }
    }

    /// Delete all keys in the database.
    pub async fn flush_all(&mut self) -> Result<(), Error> {
        match self.do_request(command(&["FLUSHALL"])).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            BytesFrame::Error(msg) => Err(Error::Server(msg.to_string())),
            other => Err(Error::Protocol(format!(
                "unexpected flushall response: {other:?}"
            ))),
        }
    }

    /// One request/reply round trip. Any transport failure latches the
    /// client; further calls fail without touching the socket.
    async fn do_request(&mut self, request: BytesFrame) -> Result<BytesFrame, Error> {
        if let Some(cause) = &self.conn_err {
            return Err(Error::Unusable(cause.clone()));
        }
        if let Err(err) = self.framed.send(request).await {
            return Err(self.latch(err.to_string()));
        }
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => Err(self.latch(err.to_string())),
            None => Err(self.latch("connection closed".to_string())),
        }
    }

    fn latch(&mut self, cause: String) -> Error {
        self.conn_err = Some(cause.clone());
        Error::Transport(cause)
    }
}

fn command(parts: &[&str]) -> BytesFrame {
    BytesFrame::Array(
        parts
            .iter()
            .map(|part| BytesFrame::BulkString(Bytes::from(part.as_bytes().to_vec())))
            .collect(),
    )
}
