//! Object storage abstraction over the bucket that source documents land in.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::pipeline::DocumentKey;

/// Errors emitted by object storage operations.
///
/// `NotFound` is a distinct variant because the worker treats a missing
/// object as "a prior attempt already finished cleanup", not as a failure.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient object store error: {0}")]
    Transient(String),
}

/// Trait abstracting the object-store service.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Retrieve the full document payload for `key`.
    async fn fetch(&self, key: &DocumentKey) -> Result<Bytes, ObjectStoreError>;

    /// Delete the object. Deleting an absent key is not an error.
    async fn delete(&self, key: &DocumentKey) -> Result<(), ObjectStoreError>;
}

/// S3-backed object store bound to a single bucket.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn fetch(&self, key: &DocumentKey) -> Result<Bytes, ObjectStoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.object_key())
            .send()
            .await;

        match response {
            Ok(output) => {
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|err| ObjectStoreError::Transient(err.to_string()))?;
                Ok(body.into_bytes())
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Err(ObjectStoreError::NotFound(key.object_key().to_string()))
                } else {
                    Err(ObjectStoreError::Transient(service_err.to_string()))
                }
            }
        }
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.object_key())
            .send()
            .await
            .map_err(|err| ObjectStoreError::Transient(err.to_string()))?;
        Ok(())
    }
}
