use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{error::PersistorError, models::BlobTarget, ports::BlobStore};

/// Blob store on a local directory tree: `<root>/<container>/<key>`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, target: &BlobTarget) -> PathBuf {
        self.root.join(&target.container).join(target.key())
    }

    async fn ensure_parent(&self, path: &Path, target: &BlobTarget) -> Result<(), PersistorError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistorError::write(target.path(), e))?;
        }
        Ok(())
    }
}

async fn remove_staging(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove staging file {}: {}", staging.display(), e),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn create_block_blob(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        let path = self.path_of(target);
        self.ensure_parent(&path, target).await?;

        // Write aside, then hard-link into place: readers never see a partial blob
        // and the link fails if the name is already taken.
        let staging = path.with_file_name(format!(".{}.{}.partial", target.name, Uuid::new_v4()));
        let linked = match tokio::fs::write(&staging, body).await {
            Ok(()) => tokio::fs::hard_link(&staging, &path).await,
            Err(e) => Err(e),
        };
        remove_staging(&staging).await;

        match linked {
            Ok(()) => {
                debug!("Wrote {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PersistorError::BlobAlreadyExists(target.path())),
            Err(e) => Err(PersistorError::write(target.path(), e)),
        }
    }

    async fn create_append_blob_if_missing(&self, target: &BlobTarget) -> Result<bool, PersistorError> {
        let path = self.path_of(target);
        self.ensure_parent(&path, target).await?;

        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PersistorError::write(target.path(), e)),
        }
    }

    async fn append_block(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        let path = self.path_of(target);
        let body = body.as_bytes().to_vec();

        // One write(2) on an O_APPEND descriptor keeps concurrent appends whole.
        // tokio::fs would chunk large buffers, so this runs on the blocking pool.
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
            file.write_all(&body)
        })
        .await
        .map_err(|e| PersistorError::write(target.path(), e))?
        .map_err(|e| PersistorError::write(target.path(), e))
    }
}
