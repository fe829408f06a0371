//! Valthree: a clustered, Valkey-compatible key-value database whose entire
//! data set lives in a single JSON object in S3-compatible storage.
//!
//! Any number of stateless nodes may serve the same bucket/object; writes are
//! serialized across nodes by ETag-conditional PUTs. The `proptest` module
//! provides the property-based harness that checks the cluster for strong
//! serializability, backed by the `checker` linearizability checker.

pub mod checker;
pub mod client;
mod diceware;
pub mod op;
pub mod proptest;
pub mod server;
pub mod storage;
pub mod store;
pub mod strset;
