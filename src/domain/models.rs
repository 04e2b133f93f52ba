use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to a message by the messaging source.
///
/// Values stay as JSON so sources can hand over numbers or booleans; the serializer
/// coerces everything to strings.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Message {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Messages returned by one pull call of one worker.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Block,
    Append,
}

/// How a blob name was chosen. Only unique names may be regenerated on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobNaming {
    Unique,
    Fixed,
    TimeBucket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobTarget {
    pub container: String,
    pub folder: String,
    pub date: NaiveDate,
    pub name: String,
    pub kind: BlobKind,
    pub naming: BlobNaming,
}

impl BlobTarget {
    /// Object key inside the container: `{folder}/{YYYY}/{MM}/{DD}/{name}`.
    pub fn key(&self) -> String {
        format!(
            "{}/{:04}/{:02}/{:02}/{}",
            self.folder,
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.name
        )
    }

    /// Full path including the container.
    pub fn path(&self) -> String {
        format!("{}/{}", self.container, self.key())
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub worker: usize,
    pub status: WorkerStatus,
    pub messages_persisted: usize,
    pub batches_written: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl WorkerOutcome {
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            status: WorkerStatus::Succeeded,
            messages_persisted: 0,
            batches_written: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record_batch(&mut self, messages: usize) {
        self.messages_persisted += messages;
        self.batches_written += 1;
    }

    pub fn fail(&mut self, error: impl ToString) {
        self.status = WorkerStatus::Failed;
        self.errors.push(error.to_string());
    }

    pub fn warn(&mut self, warning: impl ToString) {
        self.warnings.push(warning.to_string());
    }

    pub fn succeeded(&self) -> bool {
        self.status == WorkerStatus::Succeeded
    }
}

/// Result of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSummary {
    pub workers: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub messages_persisted: usize,
    pub outcomes: Vec<WorkerOutcome>,
}

impl InvocationSummary {
    pub fn from_outcomes(outcomes: Vec<WorkerOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        Self {
            workers: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            messages_persisted: outcomes.iter().map(|o| o.messages_persisted).sum(),
            outcomes,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Parameters sent with every fan-out call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub workers_per_call: usize,
    pub batch_store_size: Option<usize>,
    pub once: bool,
}

impl Default for InvocationRequest {
    fn default() -> Self {
        Self {
            workers_per_call: 1,
            batch_store_size: None,
            once: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionResponse {
    pub status: u16,
    pub body: String,
}

impl FunctionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFailure {
    pub call: usize,
    pub reason: String,
}

/// Result of one invoker fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokerSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub messages_persisted: usize,
    pub failures: Vec<CallFailure>,
}
