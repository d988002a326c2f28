//! Queue abstraction and the SQS adapter.
//!
//! The queue is consumed with at-least-once semantics: a message is only
//! removed after the worker confirms the relational commit, so redelivery is
//! normal operation, not an anomaly.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::{DocumentKey, KeyError};

/// A received queue message. The worker holds it only while processing; the
/// queue owns its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Handle used for delete/extend operations.
    pub receipt: String,
    pub body: String,
    /// How many times this message has been delivered, this delivery included.
    pub receive_count: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("transient queue error: {0}")]
    Transient(String),
}

/// Errors classifying a message payload as malformed (poison, never retried).
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no Records[0].s3.object.key")]
    MissingKey,

    #[error("object key is not valid percent-encoded UTF-8")]
    Encoding,

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Trait abstracting the queue service.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn receive(
        &self,
        max_messages: u32,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Keep an in-flight message hidden from other consumers.
    async fn extend_visibility(
        &self,
        message: &QueueMessage,
        duration: Duration,
    ) -> Result<(), QueueError>;

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Forward a poison message to the configured dead-letter sink. Adapters
    /// without a sink log and succeed; the caller deletes afterwards either way.
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError>;
}

/// Extract the document key from an S3 event notification payload.
///
/// The key must be extractable deterministically: same body, same key. S3
/// percent-encodes keys in event payloads and encodes spaces before an
/// opening parenthesis as `+`, so both are undone here.
pub fn parse_document_key(body: &str) -> Result<DocumentKey, PayloadError> {
    let payload: serde_json::Value = serde_json::from_str(body)?;
    let raw_key = payload
        .pointer("/Records/0/s3/object/key")
        .and_then(|v| v.as_str())
        .ok_or(PayloadError::MissingKey)?;

    let decoded = urlencoding::decode(raw_key).map_err(|_| PayloadError::Encoding)?;
    let cleaned = decoded.replace("+(", " (");
    Ok(DocumentKey::new(cleaned)?)
}

/// SQS-backed queue client.
#[derive(Debug, Clone)]
pub struct SqsQueueClient {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    dead_letter_url: Option<String>,
}

impl SqsQueueClient {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: impl Into<String>,
        dead_letter_url: Option<String>,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            dead_letter_url,
        }
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(
        &self,
        max_messages: u32,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32)
            .visibility_timeout(visibility.as_secs() as i32)
            .message_system_attribute_names(
                aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
            )
            .send()
            .await
            .map_err(|err| QueueError::Transient(err.to_string()))?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|msg| {
                let receipt = msg.receipt_handle?;
                let body = msg.body.unwrap_or_default();
                let receive_count = msg
                    .attributes
                    .as_ref()
                    .map(receive_count_from_attributes)
                    .unwrap_or(1);
                Some(QueueMessage {
                    receipt,
                    body,
                    receive_count,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn extend_visibility(
        &self,
        message: &QueueMessage,
        duration: Duration,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt)
            .visibility_timeout(duration.as_secs() as i32)
            .send()
            .await
            .map_err(|err| QueueError::Transient(err.to_string()))?;
        Ok(())
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt)
            .send()
            .await
            .map_err(|err| QueueError::Transient(err.to_string()))?;
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let Some(dead_letter_url) = &self.dead_letter_url else {
            tracing::warn!(%reason, "no dead-letter queue configured; poison message will be dropped");
            return Ok(());
        };

        let reason_attribute = aws_sdk_sqs::types::MessageAttributeValue::builder()
            .data_type("String")
            .string_value(reason)
            .build()
            .map_err(|err| QueueError::Transient(err.to_string()))?;

        self.client
            .send_message()
            .queue_url(dead_letter_url)
            .message_body(&message.body)
            .message_attributes("reason", reason_attribute)
            .send()
            .await
            .map_err(|err| QueueError::Transient(err.to_string()))?;
        Ok(())
    }
}

fn receive_count_from_attributes(
    attributes: &std::collections::HashMap<aws_sdk_sqs::types::MessageSystemAttributeName, String>,
) -> u32 {
    attributes
        .get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|count| count.parse().ok())
        .unwrap_or(1)
}

/// Build a minimal S3 event body for a raw (already percent-encoded) key.
/// Used by tests and by the dead-letter forwarding path in fakes.
pub fn s3_event_body(encoded_key: &str) -> String {
    serde_json::json!({ "Records": [ { "s3": { "object": { "key": encoded_key } } } ] }).to_string()
}
