use std::time::Duration;

use tracing::{debug, error, warn};

use crate::domain::{
    error::PersistorError,
    models::Batch,
    ports::{MessageSource, SourceConnector},
};

/// Extra time a source gets to hand back its partial batch after the pull timeout.
pub const PULL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullSettings {
    pub max_batch_size: usize,
    pub timeout: Duration,
}

/// Pulls batches over one dedicated source connection.
pub struct BatchPuller {
    source: Box<dyn MessageSource>,
    settings: PullSettings,
}

impl BatchPuller {
    pub fn new(source: Box<dyn MessageSource>, settings: PullSettings) -> Self {
        Self { source, settings }
    }

    pub async fn connect(connector: &dyn SourceConnector, settings: PullSettings) -> Result<Self, PersistorError> {
        debug!("Opening messaging source connection");
        let source = connector.connect().await.map_err(|e| {
            error!("Failed to connect to messaging source: {}", e);
            e
        })?;
        Ok(Self::new(source, settings))
    }

    pub fn settings(&self) -> PullSettings {
        self.settings
    }

    /// Pulls one batch, bounded by the pull timeout and by `budget`.
    pub async fn pull(&mut self, budget: Duration) -> Result<Batch, PersistorError> {
        let timeout = self.settings.timeout.min(budget);
        debug!(
            "Pulling up to {} messages (timeout {:?})",
            self.settings.max_batch_size, timeout
        );

        let batch = tokio::time::timeout(
            timeout + PULL_GRACE,
            self.source.pull(self.settings.max_batch_size, timeout),
        )
        .await
        .map_err(|_| {
            warn!("Messaging source did not return within {:?}", timeout + PULL_GRACE);
            PersistorError::PullTimeout(timeout)
        })??;

        debug!("Pulled {} messages", batch.len());
        Ok(batch)
    }

    /// Acknowledges a batch. Only call after the batch was written.
    pub async fn checkpoint(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.source.checkpoint(batch).await.map_err(|e| {
            error!("Failed to checkpoint batch {}: {}", batch.id, e);
            e
        })?;
        debug!("Checkpointed {} messages of batch {}", batch.len(), batch.id);
        Ok(())
    }

    /// Hands a batch back to the source after a failed write. Failures are only logged;
    /// unacknowledged messages are redelivered eventually either way.
    pub async fn abandon(&mut self, batch: &Batch) {
        if batch.is_empty() {
            return;
        }
        match self.source.abandon(batch).await {
            Ok(()) => debug!("Abandoned {} messages of batch {}", batch.len(), batch.id),
            Err(e) => warn!("Failed to abandon batch {}: {}", batch.id, e),
        }
    }
}
