//! In-memory fakes of the messaging and storage capabilities for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    error::PersistorError,
    models::{Batch, BlobKind, BlobTarget, Message},
    ports::{BlobStore, MessageSource, SourceConnector},
};

// ── Messaging source ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SourceStep {
    Messages(Vec<Message>),
    Delayed(Duration, Vec<Message>),
    Fail(String),
    Hang,
}

#[derive(Default)]
struct SourceLog {
    checkpointed: Vec<String>,
    abandoned: Vec<String>,
    connections: usize,
}

/// Hands every new connection the next script; exhausted scripts pull empty batches.
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<SourceStep>>>,
    log: Arc<Mutex<SourceLog>>,
    unavailable: bool,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Vec<SourceStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            log: Arc::default(),
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn checkpointed_payloads(&self) -> Vec<String> {
        self.log.lock().unwrap().checkpointed.clone()
    }

    pub fn abandoned_payloads(&self) -> Vec<String> {
        self.log.lock().unwrap().abandoned.clone()
    }

    pub fn connections(&self) -> usize {
        self.log.lock().unwrap().connections
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn MessageSource>, PersistorError> {
        if self.unavailable {
            return Err(PersistorError::SourceUnavailable("connection refused".to_string()));
        }
        self.log.lock().unwrap().connections += 1;
        let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedSource {
            steps: steps.into(),
            in_flight: HashMap::new(),
            log: self.log.clone(),
        }))
    }
}

struct ScriptedSource {
    steps: VecDeque<SourceStep>,
    in_flight: HashMap<uuid::Uuid, Vec<String>>,
    log: Arc<Mutex<SourceLog>>,
}

impl ScriptedSource {
    fn hand_out(&mut self, messages: Vec<Message>, max: usize) -> Batch {
        let mut messages = messages;
        if messages.len() > max {
            let rest = messages.split_off(max);
            self.steps.push_front(SourceStep::Messages(rest));
        }
        let batch = Batch::new(messages);
        self.in_flight
            .insert(batch.id, batch.messages.iter().map(|m| m.payload.clone()).collect());
        batch
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn pull(&mut self, max_batch_size: usize, _timeout: Duration) -> Result<Batch, PersistorError> {
        match self.steps.pop_front() {
            None => Ok(Batch::empty()),
            Some(SourceStep::Messages(messages)) => Ok(self.hand_out(messages, max_batch_size)),
            Some(SourceStep::Delayed(delay, messages)) => {
                tokio::time::sleep(delay).await;
                Ok(self.hand_out(messages, max_batch_size))
            }
            Some(SourceStep::Fail(reason)) => Err(PersistorError::SourceUnavailable(reason)),
            Some(SourceStep::Hang) => std::future::pending().await,
        }
    }

    async fn checkpoint(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        let payloads = self
            .in_flight
            .remove(&batch.id)
            .ok_or_else(|| PersistorError::Checkpoint(format!("unknown batch {}", batch.id)))?;
        self.log.lock().unwrap().checkpointed.extend(payloads);
        Ok(())
    }

    async fn abandon(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        if let Some(payloads) = self.in_flight.remove(&batch.id) {
            self.log.lock().unwrap().abandoned.extend(payloads);
        }
        Ok(())
    }
}

// ── Blob storage ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredBlob {
    kind: BlobKind,
    content: String,
}

#[derive(Default)]
struct StoreState {
    blobs: HashMap<String, StoredBlob>,
    append_calls: Vec<String>,
    transient_failures: usize,
}

/// Blob store backed by a map. Appends are atomic per call.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<StoreState>,
    poison: Option<String>,
    append_latency: Option<Duration>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write whose body contains `marker` fails.
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            poison: Some(marker.into()),
            ..Self::default()
        }
    }

    pub fn with_append_latency(mut self, latency: Duration) -> Self {
        self.append_latency = Some(latency);
        self
    }

    /// The next `count` writes fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().transient_failures = count;
    }

    pub fn insert_block(&self, path: &str, content: &str) {
        self.state.lock().unwrap().blobs.insert(
            path.to_string(),
            StoredBlob {
                kind: BlobKind::Block,
                content: content.to_string(),
            },
        );
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().blobs.get(path).map(|b| b.content.clone())
    }

    pub fn kind(&self, path: &str) -> Option<BlobKind> {
        self.state.lock().unwrap().blobs.get(path).map(|b| b.kind)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state.lock().unwrap().blobs.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn append_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().append_calls.clone()
    }

    fn check_failure(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        if let Some(marker) = &self.poison {
            if body.contains(marker.as_str()) {
                return Err(PersistorError::write(target.path(), "injected failure"));
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(PersistorError::write(target.path(), "transient failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_block_blob(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        self.check_failure(target, body)?;
        let mut state = self.state.lock().unwrap();
        if state.blobs.contains_key(&target.path()) {
            return Err(PersistorError::BlobAlreadyExists(target.path()));
        }
        state.blobs.insert(
            target.path(),
            StoredBlob {
                kind: BlobKind::Block,
                content: body.to_string(),
            },
        );
        Ok(())
    }

    async fn create_append_blob_if_missing(&self, target: &BlobTarget) -> Result<bool, PersistorError> {
        let mut state = self.state.lock().unwrap();
        if state.blobs.contains_key(&target.path()) {
            return Ok(false);
        }
        state.blobs.insert(
            target.path(),
            StoredBlob {
                kind: BlobKind::Append,
                content: String::new(),
            },
        );
        Ok(true)
    }

    async fn append_block(&self, target: &BlobTarget, body: &str) -> Result<(), PersistorError> {
        if let Some(latency) = self.append_latency {
            tokio::time::sleep(latency).await;
        }
        self.check_failure(target, body)?;
        let mut state = self.state.lock().unwrap();
        let blob = state
            .blobs
            .get_mut(&target.path())
            .ok_or_else(|| PersistorError::write(target.path(), "blob does not exist"))?;
        if blob.kind != BlobKind::Append {
            return Err(PersistorError::write(target.path(), "not an append blob"));
        }
        blob.content.push_str(body);
        state.append_calls.push(body.to_string());
        Ok(())
    }
}
