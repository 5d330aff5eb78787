//! Owned record and partition identifiers

use bytes::Bytes;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use std::fmt;
use std::sync::Arc;

/// A topic partition owned (or formerly owned) by this consumer instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: Arc<str>,
    partition: i32,
}

impl Partition {
    /// Create a partition identifier
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Topic name
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition number
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A single header; Kafka allows null header values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Header key
    pub key: String,
    /// Header value, `None` for a null header
    pub value: Option<Bytes>,
}

/// A record detached from the client buffer.
///
/// Key and payload are reference counted so the record can be cloned into a
/// [`FailedRecordContext`](crate::consumer::dlq::FailedRecordContext) without
/// copying the bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    partition: Partition,
    offset: i64,
    key: Option<Bytes>,
    payload: Option<Bytes>,
    headers: Vec<RecordHeader>,
    timestamp: Option<i64>,
}

impl ConsumedRecord {
    /// Build a record by hand (tests, replay tooling)
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    /// Set the record key
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the record payload
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Append a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    /// Set the broker timestamp in epoch millis
    pub fn with_timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Detach a message from the rdkafka buffer
    pub fn from_message(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| RecordHeader {
                        key: h.key.to_string(),
                        value: h.value.map(Bytes::copy_from_slice),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            partition: Partition::new(message.topic(), message.partition()),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }

    /// Source partition
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Record offset
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Record key
    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    /// Record payload
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// All headers in arrival order
    pub fn headers(&self) -> &[RecordHeader] {
        &self.headers
    }

    /// Broker timestamp in epoch millis
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// First header with the given key
    pub fn header(&self, key: &str) -> Option<&RecordHeader> {
        self.headers.iter().find(|h| h.key == key)
    }

    /// First header value with the given key, decoded as UTF-8
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header(key)
            .and_then(|h| h.value.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Add a header only when no header with that key exists yet
    pub(crate) fn insert_header_if_absent(&mut self, key: &str, value: impl Into<Bytes>) {
        if self.header(key).is_none() {
            self.headers.push(RecordHeader {
                key: key.to_string(),
                value: Some(value.into()),
            });
        }
    }
}
