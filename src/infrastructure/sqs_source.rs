use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::{
    types::{ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry, Message as SqsMessage},
    Client,
};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::{
    error::PersistorError,
    models::{Batch, Message, Metadata},
    ports::{MessageSource, SourceConnector},
};

/// SQS caps both the messages per receive and the entries per batch request at 10.
const SQS_BATCH_LIMIT: usize = 10;
const SQS_MAX_WAIT_SECONDS: u64 = 20;

pub struct SqsConnector {
    client: Client,
    queue_url: String,
}

impl SqsConnector {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl SourceConnector for SqsConnector {
    async fn connect(&self) -> Result<Box<dyn MessageSource>, PersistorError> {
        // The SDK client is a handle onto a shared connection pool; every worker
        // still gets its own receipt bookkeeping.
        self.client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to reach SQS queue {}: {}", self.queue_url, e);
                PersistorError::SourceUnavailable(e.to_string())
            })?;

        Ok(Box::new(SqsSource {
            client: self.client.clone(),
            queue_url: self.queue_url.clone(),
            receipts: HashMap::new(),
        }))
    }
}

pub struct SqsSource {
    client: Client,
    queue_url: String,
    receipts: HashMap<Uuid, Vec<String>>,
}

fn attributes_to_metadata(message: &SqsMessage) -> Option<Metadata> {
    let attributes = message.message_attributes.as_ref()?;
    let metadata: Metadata = attributes
        .iter()
        .filter_map(|(name, value)| {
            value
                .string_value()
                .map(|v| (name.clone(), serde_json::Value::String(v.to_string())))
        })
        .collect();
    (!metadata.is_empty()).then_some(metadata)
}

impl SqsSource {
    fn receipts_of(&mut self, batch: &Batch) -> Vec<String> {
        self.receipts.remove(&batch.id).unwrap_or_default()
    }
}

/// Messages of one pull together with their receipt handles.
#[derive(Debug, Default)]
struct Collected {
    messages: Vec<Message>,
    receipts: Vec<String>,
}

/// Receives in rounds of at most ten messages until the batch is full, a round comes
/// back empty or the timeout is spent. `receive` gets the number of messages wanted and
/// the long-poll wait in seconds. A failed round ends the pull with what was collected;
/// it is an error only when nothing was.
async fn collect_rounds<F, Fut, E>(
    max_batch_size: usize,
    timeout: Duration,
    mut receive: F,
) -> Result<Collected, PersistorError>
where
    F: FnMut(usize, u64) -> Fut,
    Fut: Future<Output = Result<Vec<SqsMessage>, E>>,
    E: std::fmt::Display,
{
    let stop_at = Instant::now() + timeout;
    let mut collected = Collected::default();

    while collected.messages.len() < max_batch_size {
        let remaining = stop_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wanted = (max_batch_size - collected.messages.len()).min(SQS_BATCH_LIMIT);
        let wait = remaining.as_secs().min(SQS_MAX_WAIT_SECONDS);

        debug!("Receiving up to {} messages from SQS (wait {}s)", wanted, wait);
        let received = match receive(wanted, wait).await {
            Ok(received) => received,
            Err(e) if collected.messages.is_empty() => {
                error!("Failed to receive messages from SQS: {}", e);
                return Err(PersistorError::SourceUnavailable(e.to_string()));
            }
            Err(e) => {
                warn!(
                    "Receive failed after {} messages, returning partial batch: {}",
                    collected.messages.len(),
                    e
                );
                break;
            }
        };
        if received.is_empty() {
            break;
        }

        for message in received {
            let Some(receipt) = message.receipt_handle.clone() else {
                warn!("Received message without receipt handle");
                continue;
            };
            let mut persisted = Message::new(message.body.clone().unwrap_or_default());
            if let Some(metadata) = attributes_to_metadata(&message) {
                persisted = persisted.with_metadata(metadata);
            }
            collected.messages.push(persisted);
            collected.receipts.push(receipt);
        }
    }
    Ok(collected)
}

#[async_trait]
impl MessageSource for SqsSource {
    async fn pull(&mut self, max_batch_size: usize, timeout: Duration) -> Result<Batch, PersistorError> {
        let client = &self.client;
        let queue_url = self.queue_url.as_str();
        let collected = collect_rounds(max_batch_size, timeout, move |wanted, wait| async move {
            client
                .receive_message()
                .queue_url(queue_url)
                .max_number_of_messages(wanted as i32)
                .wait_time_seconds(wait as i32)
                .message_attribute_names("All")
                .send()
                .await
                .map(|response| response.messages.unwrap_or_default())
        })
        .await?;

        let batch = Batch::new(collected.messages);
        if !batch.is_empty() {
            self.receipts.insert(batch.id, collected.receipts);
        }
        Ok(batch)
    }

    async fn checkpoint(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        let receipts = self.receipts_of(batch);
        for chunk in receipts.chunks(SQS_BATCH_LIMIT) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, receipt)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(i.to_string())
                        .receipt_handle(receipt)
                        .build()
                        .map_err(|e| PersistorError::Checkpoint(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let response = self
                .client
                .delete_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| PersistorError::Checkpoint(e.to_string()))?;

            if !response.failed().is_empty() {
                return Err(PersistorError::Checkpoint(format!(
                    "{} of {} messages could not be deleted",
                    response.failed().len(),
                    chunk.len()
                )));
            }
        }
        Ok(())
    }

    async fn abandon(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        let receipts = self.receipts_of(batch);
        for chunk in receipts.chunks(SQS_BATCH_LIMIT) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, receipt)| {
                    ChangeMessageVisibilityBatchRequestEntry::builder()
                        .id(i.to_string())
                        .receipt_handle(receipt)
                        .visibility_timeout(0)
                        .build()
                        .map_err(|e| PersistorError::SourceUnavailable(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            self.client
                .change_message_visibility_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| PersistorError::SourceUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}
