//! Application handler trait

use crate::consumer::commit::Acknowledgment;
use crate::consumer::converter::Payload;
use crate::consumer::record::ConsumedRecord;
use crate::consumer::retry::AttemptError;
use async_trait::async_trait;

/// A record as handed to the application: decoded payload plus the original
/// record, and an acknowledgment handle when offsets are committed manually
#[derive(Debug, Clone)]
pub struct InboundMessage {
    record: ConsumedRecord,
    payload: Payload,
    acknowledgment: Option<Acknowledgment>,
}

impl InboundMessage {
    pub fn new(record: ConsumedRecord, payload: Payload, acknowledgment: Option<Acknowledgment>) -> Self {
        Self {
            record,
            payload,
            acknowledgment,
        }
    }

    /// The original record
    pub fn record(&self) -> &ConsumedRecord {
        &self.record
    }

    /// Decoded payload
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Present only with `autoCommitOffset: false`
    pub fn acknowledgment(&self) -> Option<&Acknowledgment> {
        self.acknowledgment.as_ref()
    }
}

/// Trait for processing consumed records
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    /// Error type for processing
    type Error: std::error::Error + Send + Sync + 'static;

    /// Process a single message
    async fn process(&self, message: &InboundMessage) -> Result<(), Self::Error>;

    /// Called when a message is successfully processed
    async fn on_success(&self, _message: &InboundMessage) {}

    /// Called after every failed attempt
    async fn on_failure(&self, _error: &Self::Error, _message: &InboundMessage) {}

    /// Check if error is retryable
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        true
    }

    /// Get processor name for logs
    fn name(&self) -> &str {
        "MessageProcessor"
    }
}

/// One attempt: run the handler and its hooks, classifying any failure
pub(crate) async fn attempt<P: MessageProcessor>(
    processor: &P,
    message: &InboundMessage,
) -> Result<(), AttemptError> {
    match processor.process(message).await {
        Ok(()) => {
            processor.on_success(message).await;
            Ok(())
        }
        Err(e) => {
            processor.on_failure(&e, message).await;
            if processor.is_retryable(&e) {
                Err(AttemptError::retryable(e))
            } else {
                Err(AttemptError::permanent(e))
            }
        }
    }
}
