use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    error::PersistorError,
    models::{Batch, BlobTarget, FunctionResponse, InvocationRequest},
};

/// One connection to a messaging source. Owned by exactly one worker.
#[async_trait]
pub trait MessageSource: Send {
    /// Collects up to `max_batch_size` messages, returning whatever arrived once
    /// `timeout` elapses.
    async fn pull(&mut self, max_batch_size: usize, timeout: Duration) -> Result<Batch, PersistorError>;

    /// Marks the messages of a previously pulled batch as consumed.
    async fn checkpoint(&mut self, batch: &Batch) -> Result<(), PersistorError>;

    /// Releases the messages of a previously pulled batch for redelivery.
    async fn abandon(&mut self, batch: &Batch) -> Result<(), PersistorError>;
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Opens a new, independent connection.
    async fn connect(&self) -> Result<Box<dyn MessageSource>, PersistorError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates a block blob; fails with `BlobAlreadyExists` if the target exists.
    async fn create_block_blob(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError>;

    /// Creates an empty append blob. Returns `false` if it already existed.
    async fn create_append_blob_if_missing(&self, target: &BlobTarget) -> Result<bool, PersistorError>;

    /// Appends `body` as one atomic append operation.
    async fn append_block(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError>;
}

#[async_trait]
pub trait FunctionClient: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> Result<FunctionResponse, PersistorError>;
}
