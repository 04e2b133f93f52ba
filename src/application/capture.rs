use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::{
    application::writer::{BlobWriter, WriteReport, WriterSettings},
    config::PersistorConfig,
    domain::{
        blob_path::{BlobPathBuilder, WriteMode},
        error::PersistorError,
        models::{Batch, Message},
        ports::BlobStore,
        serializer::serialize_batch,
    },
};

/// Persists messages that were pushed to the service instead of pulled by a worker.
pub struct CaptureService {
    store: Arc<dyn BlobStore>,
    paths: BlobPathBuilder,
    writer: WriterSettings,
    write_mode: WriteMode,
    include_metadata: bool,
}

impl CaptureService {
    pub fn new(
        store: Arc<dyn BlobStore>,
        paths: BlobPathBuilder,
        writer: WriterSettings,
        write_mode: WriteMode,
        include_metadata: bool,
    ) -> Self {
        Self {
            store,
            paths,
            writer,
            write_mode,
            include_metadata,
        }
    }

    pub fn from_config(config: &PersistorConfig, store: Arc<dyn BlobStore>) -> Self {
        Self::new(
            store,
            BlobPathBuilder::new(config.container.clone(), config.store_param.clone()),
            config.writer_settings(),
            config.write_mode.clone(),
            config.include_metadata,
        )
    }

    /// Writes one delivered set of messages. Returns `None` when there was nothing to write.
    pub async fn capture(&self, messages: Vec<Message>) -> Result<Option<WriteReport>, PersistorError> {
        if messages.is_empty() {
            debug!("No messages delivered, nothing to capture");
            return Ok(None);
        }

        let batch = Batch::new(messages);
        let body = serialize_batch(&batch, self.include_metadata);
        let target = self.paths.target_for(&self.write_mode, Utc::now(), batch.id);

        let mut writer = BlobWriter::new(self.store.clone(), self.writer);
        let report = match self.write_mode {
            WriteMode::Append(_) => writer.append_batch(&target, &body).await,
            WriteMode::Block => writer.write_block(&target, &body).await,
        }
        .map_err(|e| {
            error!("Failed to capture {} messages: {}", batch.len(), e);
            e
        })?;

        info!("Captured {} messages to {}", batch.len(), report.target.path());
        Ok(Some(report))
    }
}
