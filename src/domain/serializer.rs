//! Text format of persisted messages.
//!
//! Every message becomes one compact JSON object whose first key is `DATA`. Metadata,
//! when included, is merged into the same object. Records are joined by a blank line:
//!
//! ```text
//! {"DATA":"m1","origin":"sensor-7"}
//!
//! {"DATA":"m2"}
//! ```

use serde_json::{Map, Value};

use crate::domain::{
    error::PersistorError,
    models::{Batch, Message, Metadata},
};

pub const DATA_KEY: &str = "DATA";
pub const RECORD_SEPARATOR: &str = "\n\n";

fn json_string(value: &str) -> String {
    Value::String(value.to_owned()).to_string()
}

fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn serialize_message(message: &Message, include_metadata: bool) -> String {
    let mut record = String::with_capacity(message.payload.len() + 12);
    record.push('{');
    record.push_str(&json_string(DATA_KEY));
    record.push(':');
    record.push_str(&json_string(&message.payload));

    if include_metadata {
        if let Some(metadata) = &message.metadata {
            for (key, value) in metadata.iter().filter(|(k, _)| k.as_str() != DATA_KEY) {
                record.push(',');
                record.push_str(&json_string(key));
                record.push(':');
                record.push_str(&json_string(&coerce(value)));
            }
        }
    }

    record.push('}');
    record
}

/// Serializes a batch. An empty batch gives an empty string.
pub fn serialize_batch(batch: &Batch, include_metadata: bool) -> String {
    serialize_messages(&batch.messages, include_metadata)
}

pub fn serialize_messages(messages: &[Message], include_metadata: bool) -> String {
    messages
        .iter()
        .map(|m| serialize_message(m, include_metadata))
        .collect::<Vec<_>>()
        .join(RECORD_SEPARATOR)
}

/// Parses persisted records back into messages.
///
/// Any amount of whitespace between records is accepted, so the content of append
/// blobs written by several workers can be read as well.
pub fn deserialize_records(body: &str) -> Result<Vec<Message>, PersistorError> {
    serde_json::Deserializer::from_str(body)
        .into_iter::<Map<String, Value>>()
        .map(|record| {
            let mut record = record.map_err(|e| PersistorError::Serialization(e.to_string()))?;
            let payload = match record.remove(DATA_KEY) {
                Some(Value::String(payload)) => payload,
                Some(other) => {
                    return Err(PersistorError::Serialization(format!(
                        "{} must be a string, found {}",
                        DATA_KEY, other
                    )))
                }
                None => return Err(PersistorError::Serialization(format!("record without {}", DATA_KEY))),
            };

            let metadata: Metadata = record.into_iter().collect();
            Ok(Message {
                payload,
                metadata: (!metadata.is_empty()).then_some(metadata),
            })
        })
        .collect()
}
