//! The optimistic-concurrency storage engine.
//!
//! The entire database is one JSON object in the object store. Writes go
//! through an ETag-guarded read-modify-write loop: conditional PUTs serialize
//! conflicting writes across nodes, and a process-local mutex serializes them
//! within one node to limit retry storms.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use antithesis_sdk::{assert_reachable, assert_unreachable};
use anyhow::anyhow;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::Mutex;

use crate::store::{ObjectStore, Precondition, StoreError};

/// Sentinel for a conditional-write conflict; internal to the retry loop and
/// never surfaced to callers.
#[derive(Debug, thiserror::Error)]
#[error("mismatched ETags")]
struct MismatchedEtag;

/// Single-object storage engine. Cross-node serialization relies entirely on
/// the object store's conditional writes; the mutex only reduces retries
/// within one process.
pub struct Storage {
    timeout: Duration,
    bucket: String,
    name: String,
    mu: Mutex<()>,
    store: Arc<dyn ObjectStore>,
}

impl Storage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            timeout,
            bucket: bucket.into(),
            name: name.into(),
            mu: Mutex::new(()),
            store,
        }
    }

    /// Create the backing bucket. A bucket we already own is success.
    pub async fn ensure_bucket_exists(&self) -> anyhow::Result<()> {
        match self.store.create_bucket(&self.bucket).await {
            Ok(()) | Err(StoreError::BucketAlreadyOwnedByYou) => Ok(()),
            Err(err) => Err(anyhow!("create bucket: {err}")),
        }
    }

    /// Read the current database. A missing object is an empty database.
    pub async fn get_db(&self) -> anyhow::Result<HashMap<String, String>> {
        let _guard = self.mu.lock().await;
        let (items, _) = self.get_db_once().await?;
        Ok(items)
    }

    /// Run `f` against a copy of the current database and write the result
    /// back, retrying from a fresh read whenever another writer got there
    /// first. Returns whatever `f` returned on the attempt that committed.
    ///
    /// The mutex is held across the whole loop, remote calls included.
    pub async fn mutate_db<F>(&self, mut f: F) -> anyhow::Result<i64>
    where
        F: FnMut(&mut HashMap<String, String>) -> anyhow::Result<i64>,
    {
        let _guard = self.mu.lock().await;

        loop {
            let (items, etag) = self.get_db_once().await?;

            // Hand the callback an independent copy so a retry starts from
            // freshly-read data rather than a previously-mutated map.
            let mut working = items.clone();
            let n = f(&mut working)?;

            match self.set_db(&working, &etag).await {
                Ok(()) => return Ok(n),
                Err(err) if err.downcast_ref::<MismatchedEtag>().is_some() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// One read of the database object: decoded items plus the current ETag.
    /// A missing object yields an empty map and an empty ETag.
    async fn get_db_once(&self) -> anyhow::Result<(HashMap<String, String>, String)> {
        let res = tokio::time::timeout(
            self.timeout,
            self.store.get_object(&self.bucket, &self.name),
        )
        .await
        .unwrap_or_else(|elapsed| Err(StoreError::Other(anyhow!(elapsed))));

        let (body, etag) = match res {
            Ok(out) => out,
            Err(StoreError::NoSuchKey) => {
                // A GET or DEL arrived before any SET succeeded, so there is
                // no database object yet. Treat it like a missing key.
                assert_reachable!(
                    "Exercised GET or DEL before database creation",
                    &json!({})
                );
                return Ok((HashMap::new(), String::new()));
            }
            Err(err) => {
                assert_reachable!(
                    "Exercised failures reading from object storage",
                    &json!({})
                );
                return Err(anyhow!("get object: {err}"));
            }
        };

        let etag = match etag {
            Some(etag) if !etag.is_empty() => etag,
            _ => {
                assert_unreachable!("Database always has an ETag", &json!({}));
                return Err(anyhow!("response has no etag"));
            }
        };

        let items: HashMap<String, String> = match serde_json::from_slice(&body) {
            Ok(items) => items,
            Err(err) => {
                assert_unreachable!(
                    "Database in object storage is always valid JSON",
                    &json!({})
                );
                return Err(anyhow!("unmarshal: {err}"));
            }
        };
        Ok((items, etag))
    }

    /// Write the database object gated on the caller's ETag: create-only when
    /// the ETag is empty, if-match otherwise.
    async fn set_db(&self, items: &HashMap<String, String>, etag: &str) -> anyhow::Result<()> {
        let body = match serde_json::to_vec(items) {
            Ok(body) => body,
            Err(err) => {
                assert_unreachable!("Database in memory is always valid JSON", &json!({}));
                return Err(anyhow!("marshal JSON: {err}"));
            }
        };

        let precondition = if etag.is_empty() {
            Precondition::IfNoneMatch
        } else {
            Precondition::IfMatch(etag.to_string())
        };

        let res = tokio::time::timeout(
            self.timeout,
            self.store
                .put_object(&self.bucket, &self.name, Bytes::from(body), precondition),
        )
        .await
        .unwrap_or_else(|elapsed| Err(StoreError::Other(anyhow!(elapsed))));

        match res {
            Ok(()) => Ok(()),
            Err(StoreError::PreconditionFailed) => {
                // The heart of cross-node serialization: another writer
                // committed between our read and our write.
                assert_reachable!(
                    "Exercised optimistic concurrency control rollback",
                    &json!({})
                );
                Err(anyhow::Error::new(MismatchedEtag))
            }
            Err(err) => {
                assert_reachable!(
                    "Exercised failures writing to object storage",
                    &json!({})
                );
                Err(anyhow!("put object: {err}"))
            }
        }
    }
}
