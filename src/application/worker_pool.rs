use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        puller::{BatchPuller, PullSettings},
        writer::{BlobWriter, WriteReport, WriterSettings},
    },
    config::{PersistorConfig, MAX_ALLOWED_BATCH_SIZE, MAX_DURATION_SECONDS, MAX_WORKERS},
    domain::{
        blob_path::{BlobPathBuilder, WriteMode},
        error::PersistorError,
        models::{Batch, BlobTarget, InvocationSummary, WorkerOutcome},
        ports::{BlobStore, SourceConnector},
        serializer::serialize_batch,
    },
};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub worker_count: usize,
    pub deadline: Duration,
    pub safety_margin: Duration,
    pub stop_when_idle: bool,
    pub include_metadata: bool,
    pub write_mode: WriteMode,
}

impl PoolSettings {
    pub fn from_config(config: &PersistorConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            deadline: config.deadline,
            safety_margin: config.safety_margin,
            stop_when_idle: config.stop_when_idle,
            include_metadata: config.include_metadata,
            write_mode: config.write_mode.clone(),
        }
    }
}

/// Per-invocation overrides, typically taken from the triggering request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub workers: Option<usize>,
    pub max_batch_size: Option<usize>,
    /// Stop every worker after one pull-and-write iteration.
    pub once: bool,
}

struct Invocation {
    stop_at: Instant,
    once: bool,
    pull: PullSettings,
    append_target: Option<BlobTarget>,
}

/// Runs concurrent pull → serialize → write pipelines and aggregates their outcomes.
pub struct WorkerPool {
    connector: Arc<dyn SourceConnector>,
    store: Arc<dyn BlobStore>,
    paths: BlobPathBuilder,
    pull: PullSettings,
    writer: WriterSettings,
    settings: PoolSettings,
}

impl WorkerPool {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn BlobStore>,
        paths: BlobPathBuilder,
        pull: PullSettings,
        writer: WriterSettings,
        settings: PoolSettings,
    ) -> Self {
        Self {
            connector,
            store,
            paths,
            pull,
            writer,
            settings,
        }
    }

    pub fn from_config(config: &PersistorConfig, connector: Arc<dyn SourceConnector>, store: Arc<dyn BlobStore>) -> Self {
        let paths = BlobPathBuilder::new(config.container.clone(), config.store_param.clone());
        Self::new(
            connector,
            store,
            paths,
            config.pull_settings(),
            config.writer_settings(),
            PoolSettings::from_config(config),
        )
    }

    pub async fn run(&self, request: RunRequest) -> InvocationSummary {
        let workers = request
            .workers
            .unwrap_or(self.settings.worker_count)
            .clamp(1, MAX_WORKERS);
        let pull = PullSettings {
            max_batch_size: request
                .max_batch_size
                .unwrap_or(self.pull.max_batch_size)
                .clamp(1, MAX_ALLOWED_BATCH_SIZE),
            ..self.pull
        };

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_for = self
            .settings
            .deadline
            .saturating_sub(self.settings.safety_margin)
            .min(Duration::from_secs_f64(MAX_DURATION_SECONDS));
        // The append blob is pinned for the whole invocation, even across a bucket boundary.
        let append_target = match &self.settings.write_mode {
            WriteMode::Append(naming) => Some(self.paths.append_target(started_at, naming, id)),
            WriteMode::Block => None,
        };

        let invocation = Invocation {
            stop_at: Instant::now() + run_for,
            once: request.once,
            pull,
            append_target,
        };

        info!(
            "Starting invocation {} with {} workers (batch size {}, run time {:?}, once={})",
            id, workers, pull.max_batch_size, run_for, request.once
        );
        if let Some(target) = &invocation.append_target {
            info!("Appending to {}", target.path());
        }

        let outcomes = join_all((0..workers).map(|worker| self.run_worker(worker, &invocation))).await;
        let summary = InvocationSummary::from_outcomes(outcomes);

        if summary.all_succeeded() {
            info!(
                "✅ Invocation {} finished: {} messages persisted by {} workers",
                id, summary.messages_persisted, summary.workers
            );
        } else {
            warn!(
                "Invocation {} finished with {} of {} workers failed ({} messages persisted)",
                id, summary.failed, summary.workers, summary.messages_persisted
            );
        }
        summary
    }

    async fn run_worker(&self, worker: usize, invocation: &Invocation) -> WorkerOutcome {
        let mut outcome = WorkerOutcome::new(worker);

        let mut puller = match BatchPuller::connect(self.connector.as_ref(), invocation.pull).await {
            Ok(puller) => puller,
            Err(e) => {
                error!("Worker {} could not connect: {}", worker, e);
                outcome.fail(e);
                return outcome;
            }
        };
        let mut writer = BlobWriter::new(self.store.clone(), self.writer);
        debug!("Worker {} started", worker);

        loop {
            let remaining = invocation.stop_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Worker {} reached the invocation deadline", worker);
                break;
            }

            let batch = match puller.pull(remaining).await {
                Ok(batch) => batch,
                Err(PersistorError::PullTimeout(timeout)) => {
                    warn!("Worker {} pull timed out after {:?}", worker, timeout);
                    outcome.fail(PersistorError::PullTimeout(timeout));
                    if invocation.once {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!("Worker {} lost its messaging source: {}", worker, e);
                    outcome.fail(e);
                    break;
                }
            };

            if batch.is_empty() {
                debug!("Worker {} pulled an empty batch", worker);
                if invocation.once || self.settings.stop_when_idle {
                    break;
                }
                continue;
            }

            match self.persist(&mut writer, invocation, &batch).await {
                Ok(report) => {
                    debug!(
                        "Worker {} wrote {} messages to {} in {} calls",
                        worker,
                        batch.len(),
                        report.target.path(),
                        report.calls
                    );
                    if let Err(e) = puller.checkpoint(&batch).await {
                        // Already persisted: a redelivery only produces a duplicate record.
                        outcome.warn(e);
                    }
                    outcome.record_batch(batch.len());
                }
                Err(e) => {
                    error!("Worker {} failed to persist batch {}: {}", worker, batch.id, e);
                    puller.abandon(&batch).await;
                    outcome.fail(e);
                }
            }

            if invocation.once {
                break;
            }
        }

        debug!(
            "Worker {} done: {} messages in {} batches",
            worker, outcome.messages_persisted, outcome.batches_written
        );
        outcome
    }

    async fn persist(
        &self,
        writer: &mut BlobWriter,
        invocation: &Invocation,
        batch: &Batch,
    ) -> Result<WriteReport, PersistorError> {
        let body = serialize_batch(batch, self.settings.include_metadata);
        match &invocation.append_target {
            Some(target) => writer.append_batch(target, &body).await,
            None => {
                let target = self.paths.block_target(Utc::now(), Uuid::new_v4());
                writer.write_block(&target, &body).await
            }
        }
    }
}
