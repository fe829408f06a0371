//! Object-store access for the storage engine.
//!
//! This module provides the `ObjectStore` abstraction and two
//! implementations: `S3Store`, backed by an S3-compatible endpoint, and
//! `MemStore`, an in-memory twin with the same conditional-write semantics.
//! `MemStore` lets tests run multi-node clusters against shared storage
//! without a real object-store backend.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_s3::config::{
    BehaviorVersion, Credentials, Region, RequestChecksumCalculation,
    ResponseChecksumValidation,
};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

/// Gate for a conditional PUT.
#[derive(Clone, Debug)]
pub enum Precondition {
    /// Create-only: the object must not exist (`If-None-Match: *`).
    IfNoneMatch,
    /// Update-only: the object's current ETag must match (`If-Match`).
    IfMatch(String),
}

/// Errors surfaced by object-store operations. The engine matches on the
/// variants that drive its control flow; everything else is `Other`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such key")]
    NoSuchKey,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("bucket already owned by you")]
    BucketAlreadyOwnedByYou,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Minimal object-store surface required by the storage engine.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Create a bucket. Returns `BucketAlreadyOwnedByYou` when the caller
    /// already owns it; callers treat that as success.
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Fetch an object's body and ETag. Returns `NoSuchKey` when absent.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(Bytes, Option<String>), StoreError>;

    /// Write an object gated by the given precondition. Returns
    /// `PreconditionFailed` when the gate does not hold.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        precondition: Precondition,
    ) -> Result<(), StoreError>;
}

/// S3-compatible object store client.
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    /// Build a path-style client with static credentials. Checksum
    /// calculation and validation are enabled where the backend supports
    /// them.
    pub fn new(endpoint: &str, region: &str, user: &str, password: &str) -> Self {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(Credentials::new(user, password, None, None, "static"))
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenSupported)
            .response_checksum_validation(ResponseChecksumValidation::WhenSupported)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let res = self.client.create_bucket().bucket(bucket).send().await;
        match res {
            Ok(_) => Ok(()),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you())
                {
                    return Err(StoreError::BucketAlreadyOwnedByYou);
                }
                Err(StoreError::Other(anyhow!("create bucket: {err}")))
            }
        }
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(Bytes, Option<String>), StoreError> {
        let res = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;
        let out = match res {
            Ok(out) => out,
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Err(StoreError::NoSuchKey);
                }
                return Err(StoreError::Other(anyhow!("{err}")));
            }
        };
        let etag = out.e_tag().map(str::to_string);
        let body = out
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Other(anyhow!("read body: {err}")))?
            .into_bytes();
        Ok((body, etag))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        precondition: Precondition,
    ) -> Result<(), StoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));
        req = match precondition {
            Precondition::IfNoneMatch => req.if_none_match("*"),
            Precondition::IfMatch(etag) => req.if_match(etag),
        };
        match req.send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                // Conditional-write conflicts surface as an unmodeled service
                // error; discriminate on the error code.
                let code = err.as_service_error().and_then(|e| e.meta().code());
                if code == Some("PreconditionFailed") {
                    return Err(StoreError::PreconditionFailed);
                }
                Err(StoreError::Other(anyhow!("{err}")))
            }
        }
    }
}

/// In-memory object store with conditional-write semantics. Sharing one
/// `MemStore` across several servers models a multi-node cluster over one
/// backend.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    buckets: HashMap<String, HashMap<String, MemObject>>,
    counter: u64,
}

struct MemObject {
    body: Bytes,
    etag: String,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.buckets.contains_key(bucket) {
            return Err(StoreError::BucketAlreadyOwnedByYou);
        }
        inner.buckets.insert(bucket.to_string(), HashMap::new());
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(Bytes, Option<String>), StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let objects = inner
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::Other(anyhow!("no such bucket {bucket}")))?;
        let object = objects.get(key).ok_or(StoreError::NoSuchKey)?;
        Ok((object.body.clone(), Some(object.etag.clone())))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        precondition: Precondition,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counter += 1;
        let etag = format!("\"mem-{}\"", inner.counter);
        let objects = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::Other(anyhow!("no such bucket {bucket}")))?;
        match precondition {
            Precondition::IfNoneMatch => {
                if objects.contains_key(key) {
                    return Err(StoreError::PreconditionFailed);
                }
            }
            Precondition::IfMatch(expected) => match objects.get(key) {
                None => return Err(StoreError::PreconditionFailed),
                Some(current) if current.etag != expected => {
                    return Err(StoreError::PreconditionFailed)
                }
                Some(_) => {}
            },
        }
        objects.insert(key.to_string(), MemObject { body, etag });
        Ok(())
    }
}
