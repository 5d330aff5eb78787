//! Dead-letter routing for records that exhausted their attempts

use crate::consumer::config::{BindingConfig, DlqPartitioning, DlqProducerPolicy, DlqValueFormat};
use crate::consumer::error::PublishError;
use crate::consumer::record::{ConsumedRecord, RecordHeader};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub const HEADER_ORIGINAL_TOPIC: &str = "dlq.original.topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "dlq.original.partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "dlq.original.offset";
pub const HEADER_ERROR_MESSAGE: &str = "dlq.error.message";
pub const HEADER_ERROR_CHAIN: &str = "dlq.error.chain";
pub const HEADER_ERROR_ATTEMPTS: &str = "dlq.error.attempts";
pub const HEADER_TIMESTAMP: &str = "dlq.timestamp";

/// Separator between causes in the `dlq.error.chain` header
const CHAIN_SEPARATOR: &str = " <- ";

/// Everything known about a record that could not be processed.
/// Built once per exhausted record and consumed by the router.
#[derive(Debug, Clone)]
pub struct FailedRecordContext {
    /// The original record, including key, payload and headers
    pub record: ConsumedRecord,
    /// Error message followed by its sources, outermost first
    pub error_chain: Vec<String>,
    /// Handler invocations made
    pub attempts: u32,
    /// When the record was declared failed
    pub failed_at: DateTime<Utc>,
}

impl FailedRecordContext {
    /// Capture a failure, walking the error's source chain
    pub fn new(record: ConsumedRecord, error: &(dyn StdError + 'static), attempts: u32) -> Self {
        let mut error_chain = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            error_chain.push(cause.to_string());
            source = cause.source();
        }

        Self {
            record,
            error_chain,
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Outermost error message
    pub fn error_message(&self) -> &str {
        self.error_chain.first().map(String::as_str).unwrap_or_default()
    }
}

/// A record ready for the DLQ producer
#[derive(Debug, Clone, PartialEq)]
pub struct DlqRecord {
    pub topic: String,
    /// Explicit partition, `None` lets the producer partitioner decide
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl DlqRecord {
    /// First header value with the given key, decoded as UTF-8
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Broker acknowledgement of a DLQ publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqAck {
    pub partition: i32,
    pub offset: i64,
}

/// Producer side of the DLQ; shared by every partition worker of a binding
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DlqPublisher: Send + Sync {
    /// Publish one record, waiting for the broker acknowledgement
    async fn publish(&self, record: DlqRecord, timeout: Duration) -> Result<DlqAck, PublishError>;
}

/// [`DlqPublisher`] backed by an rdkafka `FutureProducer`
#[derive(Clone)]
pub struct KafkaDlqPublisher {
    producer: FutureProducer,
}

impl KafkaDlqPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }

    /// Underlying producer, for metadata checks
    pub fn producer(&self) -> &FutureProducer {
        &self.producer
    }
}

#[async_trait]
impl DlqPublisher for KafkaDlqPublisher {
    async fn publish(&self, record: DlqRecord, timeout: Duration) -> Result<DlqAck, PublishError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for header in &record.headers {
            headers = headers.insert(Header {
                key: header.key.as_str(),
                value: header.value.as_deref(),
            });
        }

        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(value) = record.value.as_deref() {
            future_record = future_record.payload(value);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        match self.producer.send(future_record, timeout).await {
            Ok((partition, offset)) => Ok(DlqAck { partition, offset }),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Err(PublishError::Timeout(timeout))
            }
            Err((e, _)) => Err(PublishError::Rejected {
                destination: record.topic.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// JSON value written with [`DlqValueFormat::JsonEnvelope`]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DlqEnvelope<'a> {
    error: &'a str,
    error_chain: &'a [String],
    attempts: u32,
    failed_at: String,
    original: OriginalCoordinates<'a>,
    /// Payload when it is valid UTF-8
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a str>,
    /// Payload otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_base64: Option<String>,
}

#[derive(Debug, Serialize)]
struct OriginalCoordinates<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

/// Publishes failed records to the binding's dead-letter destination
pub struct DeadLetterRouter {
    destination: String,
    policy: DlqProducerPolicy,
    publisher: Arc<dyn DlqPublisher>,
}

impl fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("destination", &self.destination)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeadLetterRouter {
    pub fn new(
        destination: impl Into<String>,
        policy: DlqProducerPolicy,
        publisher: Arc<dyn DlqPublisher>,
    ) -> Self {
        Self {
            destination: destination.into(),
            policy,
            publisher,
        }
    }

    /// Router for a resolved binding
    pub fn for_binding(config: &BindingConfig, publisher: Arc<dyn DlqPublisher>) -> Self {
        Self::new(
            config.dlq_destination(),
            config.policy().dlq_producer_policy.clone(),
            publisher,
        )
    }

    /// Resolved DLQ topic
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Publish a failed record. Any failure, including the send timeout, is a
    /// `PublishError`; the caller must not commit the source offset.
    pub async fn route(&self, context: FailedRecordContext) -> Result<DlqAck, PublishError> {
        let record = self.build_record(&context)?;
        let send_timeout = self.policy.send_timeout;

        let result = match tokio::time::timeout(send_timeout, self.publisher.publish(record, send_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(send_timeout)),
        };

        let source = context.record.partition();
        match &result {
            Ok(ack) => debug!(
                topic = source.topic(),
                partition = source.partition(),
                offset = context.record.offset(),
                dlq_topic = %self.destination,
                dlq_partition = ack.partition,
                dlq_offset = ack.offset,
                "Record routed to DLQ"
            ),
            Err(e) => error!(
                topic = source.topic(),
                partition = source.partition(),
                offset = context.record.offset(),
                dlq_topic = %self.destination,
                error = %e,
                "Failed to route record to DLQ"
            ),
        }

        result
    }

    /// Apply the producer policy to a failed record
    pub fn build_record(&self, context: &FailedRecordContext) -> Result<DlqRecord, PublishError> {
        let record = &context.record;

        let value = match self.policy.value_format {
            DlqValueFormat::Raw => record.payload().cloned(),
            DlqValueFormat::JsonEnvelope => Some(self.envelope(context)?),
        };

        let partition = match self.policy.partitioning {
            DlqPartitioning::Default => None,
            DlqPartitioning::SourcePartition => Some(record.partition().partition()),
            DlqPartitioning::Fixed(partition) => Some(partition),
        };

        Ok(DlqRecord {
            topic: self.destination.clone(),
            partition,
            key: record.key().cloned(),
            value,
            headers: Self::headers(context),
        })
    }

    fn headers(context: &FailedRecordContext) -> Vec<RecordHeader> {
        let record = &context.record;
        let header = |key: &str, value: String| RecordHeader {
            key: key.to_string(),
            value: Some(Bytes::from(value)),
        };

        let mut headers = vec![
            header(HEADER_ORIGINAL_TOPIC, record.partition().topic().to_string()),
            header(HEADER_ORIGINAL_PARTITION, record.partition().partition().to_string()),
            header(HEADER_ORIGINAL_OFFSET, record.offset().to_string()),
            header(HEADER_ERROR_MESSAGE, context.error_message().to_string()),
            header(HEADER_ERROR_CHAIN, context.error_chain.join(CHAIN_SEPARATOR)),
            header(HEADER_ERROR_ATTEMPTS, context.attempts.to_string()),
            header(HEADER_TIMESTAMP, context.failed_at.timestamp_millis().to_string()),
        ];

        // Headers from an earlier dead-lettering are replaced, not duplicated
        headers.extend(
            record
                .headers()
                .iter()
                .filter(|h| !h.key.starts_with("dlq."))
                .cloned(),
        );
        headers
    }

    fn envelope(&self, context: &FailedRecordContext) -> Result<Bytes, PublishError> {
        let record = &context.record;
        let (payload, payload_base64) = match record.payload() {
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => (Some(text), None),
                Err(_) => (None, Some(BASE64.encode(bytes))),
            },
            None => (None, None),
        };

        let envelope = DlqEnvelope {
            error: context.error_message(),
            error_chain: &context.error_chain,
            attempts: context.attempts,
            failed_at: context.failed_at.to_rfc3339(),
            original: OriginalCoordinates {
                topic: record.partition().topic(),
                partition: record.partition().partition(),
                offset: record.offset(),
                timestamp: record.timestamp(),
            },
            payload,
            payload_base64,
        };

        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| PublishError::Encoding(format!("JSON serialization error: {}", e)))
    }
}
