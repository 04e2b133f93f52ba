use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{
    blob_path::BLOB_EXTENSION,
    error::PersistorError,
    models::{BlobNaming, BlobTarget},
    ports::BlobStore,
    serializer::RECORD_SEPARATOR,
};

/// How often a uniquely named block blob is renamed after a name collision.
const MAX_RENAMES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    pub max_append_bytes: usize,
    pub write_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_append_bytes: crate::config::DEFAULT_MAX_APPEND_BYTES,
            write_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteReport {
    pub target: BlobTarget,
    pub bytes: usize,
    pub calls: usize,
}

/// Splits `body` into append calls of at most `limit` bytes.
///
/// Cuts only at record separators, so every chunk holds whole records and the chunks
/// concatenate back to `body`.
pub fn split_for_append(body: &str, limit: usize) -> Result<Vec<&str>, PersistorError> {
    if body.len() <= limit {
        return Ok(if body.is_empty() { Vec::new() } else { vec![body] });
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut end = 0;

    for piece in body.split_inclusive(RECORD_SEPARATOR) {
        // A record that fits only without its trailing separator is cut before it.
        let atoms = if piece.len() > limit && piece.ends_with(RECORD_SEPARATOR) {
            [piece.len() - RECORD_SEPARATOR.len(), RECORD_SEPARATOR.len()]
        } else {
            [piece.len(), 0]
        };

        for &len in atoms.iter().filter(|&&len| len > 0) {
            if len > limit {
                return Err(PersistorError::AppendSizeExceeded { size: len, limit });
            }
            if end - start + len > limit {
                chunks.push(&body[start..end]);
                start = end;
            }
            end += len;
        }
    }

    if end > start {
        chunks.push(&body[start..end]);
    }
    Ok(chunks)
}

/// Commits serialized bodies to block or append blobs. One writer per worker.
pub struct BlobWriter {
    store: Arc<dyn BlobStore>,
    settings: WriterSettings,
    /// Append blobs this writer already made sure exist.
    ensured: HashSet<String>,
}

impl BlobWriter {
    pub fn new(store: Arc<dyn BlobStore>, settings: WriterSettings) -> Self {
        Self {
            store,
            settings,
            ensured: HashSet::new(),
        }
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, path: &str, mut op: F) -> Result<T, PersistorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistorError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient_write() && attempt < self.settings.write_attempts => {
                    warn!(
                        "Failed to {} {}, retrying (attempt {} of {}): {}",
                        what, path, attempt, self.settings.write_attempts, e
                    );
                    tokio::time::sleep(self.settings.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if !matches!(e, PersistorError::BlobAlreadyExists(_)) {
                        error!("Failed to {} {}: {}", what, path, e);
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    /// Creates a new block blob holding `body`.
    pub async fn write_block(&self, target: &BlobTarget, body: &str) -> Result<WriteReport, PersistorError> {
        let mut target = target.clone();
        if body.is_empty() {
            debug!("Nothing to write to {}", target.path());
            return Ok(WriteReport { target, bytes: 0, calls: 0 });
        }

        for _ in 0..=MAX_RENAMES {
            let path = target.path();
            let result = self
                .with_retries("create block blob", &path, || self.store.create_block_blob(&target, body))
                .await;

            match result {
                Ok(()) => {
                    info!("Stored {} bytes to block blob {}", body.len(), path);
                    return Ok(WriteReport {
                        target,
                        bytes: body.len(),
                        calls: 1,
                    });
                }
                Err(PersistorError::BlobAlreadyExists(existing)) if target.naming == BlobNaming::Unique => {
                    warn!("Blob {} already exists, picking a new name", existing);
                    target = target.renamed(format!("{}.{}", Uuid::new_v4(), BLOB_EXTENSION));
                }
                Err(PersistorError::BlobAlreadyExists(existing)) => {
                    return Err(PersistorError::write(existing, "blob already exists"));
                }
                Err(e) => return Err(e),
            }
        }

        Err(PersistorError::write(target.path(), "no free blob name found"))
    }

    /// Makes sure the append blob exists. Losing a creation race counts as success.
    pub async fn ensure_append_blob(&mut self, target: &BlobTarget) -> Result<(), PersistorError> {
        let path = target.path();
        if self.ensured.contains(&path) {
            return Ok(());
        }

        let created = self
            .with_retries("create append blob", &path, || {
                self.store.create_append_blob_if_missing(target)
            })
            .await?;
        if created {
            info!("Created append blob {}", path);
        } else {
            debug!("Append blob {} already exists", path);
        }
        self.ensured.insert(path);
        Ok(())
    }

    /// Appends exactly `body`, split into several append calls if it exceeds the limit.
    pub async fn append(&mut self, target: &BlobTarget, body: &str) -> Result<WriteReport, PersistorError> {
        let chunks = split_for_append(body, self.settings.max_append_bytes)?;
        self.ensure_append_blob(target).await?;

        let path = target.path();
        if chunks.len() > 1 {
            debug!("Splitting {} bytes into {} appends to {}", body.len(), chunks.len(), path);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            self.with_retries("append to", &path, || self.store.append_block(target, chunk))
                .await
                .map_err(|e| {
                    if i > 0 {
                        error!("Append to {} stopped after {} of {} calls", path, i, chunks.len());
                    }
                    e
                })?;
        }

        info!("Appended {} bytes to {}", body.len(), path);
        Ok(WriteReport {
            target: target.clone(),
            bytes: body.len(),
            calls: chunks.len(),
        })
    }

    /// Appends a serialized batch terminated by the record separator, so batches from
    /// concurrent writers stay separated whatever order their appends land in.
    pub async fn append_batch(&mut self, target: &BlobTarget, serialized: &str) -> Result<WriteReport, PersistorError> {
        if serialized.is_empty() {
            return Ok(WriteReport {
                target: target.clone(),
                bytes: 0,
                calls: 0,
            });
        }
        self.append(target, &format!("{}{}", serialized, RECORD_SEPARATOR)).await
    }
}
