use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{
    error::PersistorError,
    models::{Batch, Message, Metadata},
    ports::{MessageSource, SourceConnector},
};

/// Opens a durable pull consumer per worker. Workers sharing the consumer group
/// share the consumer and split its messages.
pub struct JetStreamConnector {
    url: String,
    stream: String,
    consumer_group: String,
}

impl JetStreamConnector {
    pub fn new(url: String, stream: String, consumer_group: String) -> Self {
        Self {
            url,
            stream,
            consumer_group,
        }
    }
}

#[async_trait]
impl SourceConnector for JetStreamConnector {
    async fn connect(&self) -> Result<Box<dyn MessageSource>, PersistorError> {
        debug!("Connecting to NATS at {}", self.url);
        let client = async_nats::connect(&self.url).await.map_err(|e| {
            error!("Failed to connect to NATS at {}: {}", self.url, e);
            PersistorError::SourceUnavailable(e.to_string())
        })?;
        let context = jetstream::new(client);

        let consumer: PullConsumer = context
            .create_consumer_on_stream(
                jetstream::consumer::pull::Config {
                    durable_name: Some(self.consumer_group.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
                self.stream.as_str(),
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to open consumer {} on stream {}: {}",
                    self.consumer_group, self.stream, e
                );
                PersistorError::SourceUnavailable(e.to_string())
            })?;

        info!("Connected to stream {} as {}", self.stream, self.consumer_group);
        Ok(Box::new(JetStreamSource {
            consumer,
            in_flight: HashMap::new(),
        }))
    }
}

pub struct JetStreamSource {
    consumer: PullConsumer,
    in_flight: HashMap<Uuid, Vec<jetstream::Message>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Delivery {
    stream_sequence: u64,
    delivered: i64,
    published: Option<DateTime<Utc>>,
}

impl Delivery {
    fn of(message: &jetstream::Message) -> Option<Self> {
        let info = message.info().ok()?;
        Some(Self {
            stream_sequence: info.stream_sequence,
            delivered: info.delivered,
            published: DateTime::<Utc>::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond()),
        })
    }
}

/// System properties of a stream message, in the shape the persisted records use.
fn system_properties(subject: &str, delivery: Option<&Delivery>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("subject".to_string(), Value::String(subject.to_string()));
    if let Some(delivery) = delivery {
        metadata.insert("sequence_number".to_string(), Value::from(delivery.stream_sequence));
        metadata.insert("delivery_count".to_string(), Value::from(delivery.delivered));
        if let Some(published) = delivery.published {
            metadata.insert("enqueued_time".to_string(), Value::String(published.to_rfc3339()));
        }
    }
    metadata
}

/// Drains one fetch. Failed items are skipped while others arrive; a fetch that
/// produced nothing but errors means the source is gone.
async fn collect_fetched<S, T, E>(mut fetched: S) -> Result<Vec<T>, PersistorError>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut collected = Vec::new();
    let mut first_error = None;
    while let Some(result) = fetched.next().await {
        match result {
            Ok(item) => collected.push(item),
            Err(e) => {
                warn!("Error receiving message from stream: {}", e);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    match first_error {
        Some(reason) if collected.is_empty() => {
            error!("Fetch from stream failed without delivering messages: {}", reason);
            Err(PersistorError::SourceUnavailable(reason))
        }
        Some(_) => {
            warn!("Fetch interrupted, returning partial batch of {} messages", collected.len());
            Ok(collected)
        }
        None => Ok(collected),
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn pull(&mut self, max_batch_size: usize, timeout: Duration) -> Result<Batch, PersistorError> {
        let fetched = self
            .consumer
            .fetch()
            .max_messages(max_batch_size)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| PersistorError::SourceUnavailable(e.to_string()))?;

        let raw = collect_fetched(fetched).await?;

        let messages = raw
            .iter()
            .map(|m| {
                let properties = system_properties(&m.subject.to_string(), Delivery::of(m).as_ref());
                Message::new(String::from_utf8_lossy(&m.payload).into_owned()).with_metadata(properties)
            })
            .collect();
        let batch = Batch::new(messages);
        if !batch.is_empty() {
            self.in_flight.insert(batch.id, raw);
        }
        Ok(batch)
    }

    async fn checkpoint(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        let Some(messages) = self.in_flight.remove(&batch.id) else {
            return Ok(());
        };
        let mut failed = 0;
        for message in &messages {
            if let Err(e) = message.ack().await {
                warn!("Failed to acknowledge message on {}: {}", message.subject, e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(PersistorError::Checkpoint(format!(
                "{} of {} messages could not be acknowledged",
                failed,
                messages.len()
            )));
        }
        Ok(())
    }

    async fn abandon(&mut self, batch: &Batch) -> Result<(), PersistorError> {
        let Some(messages) = self.in_flight.remove(&batch.id) else {
            return Ok(());
        };
        for message in &messages {
            message
                .ack_with(AckKind::Nak(None))
                .await
                .map_err(|e| PersistorError::SourceUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}
