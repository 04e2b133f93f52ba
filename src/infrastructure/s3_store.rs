use async_trait::async_trait;
use aws_sdk_s3::{config::http::HttpResponse, error::SdkError, primitives::ByteStream, Client};
use tracing::{debug, error, warn};

use crate::domain::{error::PersistorError, models::BlobTarget, ports::BlobStore};

/// Offset conflicts are retried this often before an append is given up.
const APPEND_CONFLICT_RETRIES: usize = 5;

/// Blob store on S3. The container is the bucket, the blob key the object key.
///
/// Appends use `write_offset_bytes`, which S3 only honours on directory buckets.
pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn put_if_absent(&self, target: &BlobTarget, body: &str) -> Result<bool, PersistorError> {
        let result = self
            .client
            .put_object()
            .bucket(&target.container)
            .key(target.key())
            .if_none_match("*")
            .body(ByteStream::from(body.as_bytes().to_vec()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(412) => Ok(false),
            Err(e) => Err(PersistorError::write(target.path(), e)),
        }
    }

    async fn current_length(&self, target: &BlobTarget) -> Result<i64, PersistorError> {
        let head = self
            .client
            .head_object()
            .bucket(&target.container)
            .key(target.key())
            .send()
            .await
            .map_err(|e| PersistorError::write(target.path(), e))?;
        Ok(head.content_length().unwrap_or(0))
    }
}

fn status_of<E>(error: &SdkError<E, HttpResponse>) -> Option<u16> {
    error.raw_response().map(|r| r.status().as_u16())
}

/// Another writer appended between our HEAD and PUT. Any other status, including the
/// 400 a bucket without offset appends answers with, is final.
fn is_offset_conflict(status: Option<u16>) -> bool {
    matches!(status, Some(409 | 412))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn create_block_blob(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        debug!("Putting s3://{}/{}", target.container, target.key());
        if self.put_if_absent(target, body).await? {
            Ok(())
        } else {
            Err(PersistorError::BlobAlreadyExists(target.path()))
        }
    }

    async fn create_append_blob_if_missing(&self, target: &BlobTarget) -> Result<bool, PersistorError> {
        self.put_if_absent(target, "").await
    }

    async fn append_block(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        for attempt in 1..=APPEND_CONFLICT_RETRIES {
            let offset = self.current_length(target).await?;
            let result = self
                .client
                .put_object()
                .bucket(&target.container)
                .key(target.key())
                .write_offset_bytes(offset)
                .body(ByteStream::from(body.as_bytes().to_vec()))
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if is_offset_conflict(status_of(&e)) => {
                    warn!(
                        "Append offset {} on {} is stale (attempt {} of {})",
                        offset,
                        target.path(),
                        attempt,
                        APPEND_CONFLICT_RETRIES
                    );
                }
                Err(e) => {
                    error!("Failed to append to {}: {}", target.path(), e);
                    return Err(PersistorError::write(target.path(), e));
                }
            }
        }
        Err(PersistorError::write(target.path(), "append offset kept changing"))
    }
}
