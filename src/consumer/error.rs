//! Consumer error types

use std::time::Duration;
use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client errors
    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    /// Configuration errors, raised while resolving a binding
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Payload conversion errors
    #[error("Conversion error: {0}")]
    ConversionError(#[from] ConversionError),

    /// Processing errors
    #[error("Processing error: {0}")]
    ProcessingError(String),

    /// Offset management errors
    #[error("Offset error: {0}")]
    OffsetError(String),

    /// DLQ errors
    #[error("DLQ error: {0}")]
    DlqError(#[from] PublishError),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Channel errors
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Shutdown errors
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl ConsumerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::KafkaError(e) => {
                !matches!(e, rdkafka::error::KafkaError::MessageConsumption(_))
            }
            ConsumerError::ConnectionError(_) => true,
            ConsumerError::Timeout(_) => true,
            ConsumerError::ProcessingError(_) => true,
            ConsumerError::ConversionError(_) => false,
            ConsumerError::ConfigError(_) => false,
            ConsumerError::DlqError(_) => false,
            _ => false,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ConsumerError::ConfigError(_) => ErrorSeverity::Fatal,
            ConsumerError::DlqError(_) => ErrorSeverity::Fatal,
            ConsumerError::ConversionError(_) => ErrorSeverity::Warning,
            ConsumerError::Timeout(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Warnings that don't stop processing
    Warning,
    /// Errors that may be retried
    Error,
    /// Fatal errors that stop the consumer
    Fatal,
}

/// Failure to hand a record to the dead-letter destination.
///
/// Callers treat this as "commit skipped": the record will most likely be
/// reprocessed after a restart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The publish did not complete within the configured send timeout
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The broker or producer rejected the record
    #[error("publish to '{destination}' rejected: {reason}")]
    Rejected {
        /// DLQ topic the record was addressed to
        destination: String,
        /// Reason reported by the producer
        reason: String,
    },

    /// The record could not be encoded with the DLQ producer policy
    #[error("DLQ encoding failed: {0}")]
    Encoding(String),
}

/// Errors raised while decoding an inbound payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The payload declared a type that is not on the trusted allow-list
    #[error("payload type '{0}' is not trusted")]
    UntrustedType(String),

    /// The record carried no payload
    #[error("record has no payload")]
    MissingPayload,

    /// The payload bytes could not be decoded
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Convert from channel send errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ConsumerError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ConsumerError::ChannelError(format!("Failed to send: {}", err))
    }
}
