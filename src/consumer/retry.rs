//! Bounded fixed-interval retry and exhaustion handling

use crate::consumer::config::MAX_ATTEMPTS_CEILING;
use crate::consumer::dlq::{DeadLetterRouter, DlqAck, FailedRecordContext};
use crate::consumer::error::PublishError;
use crate::consumer::metrics::{ConsumerEvent, MetricsSink};
use crate::consumer::record::ConsumedRecord;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Retry policy: a fixed pause between attempts, no jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total handler invocations per record, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS_CEILING,
            interval: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_CEILING),
            interval,
        }
    }

    /// Whether another attempt may follow attempt number `attempt`
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A failed handler invocation
#[derive(Debug)]
pub struct AttemptError {
    error: Box<dyn StdError + Send + Sync>,
    retryable: bool,
}

impl AttemptError {
    /// Failure that may succeed on a later attempt
    pub fn retryable(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }

    /// Failure that goes straight to the exhaustion path
    pub fn permanent(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The underlying error
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.error.as_ref()
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

/// Why a record ended fatal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCause {
    /// Attempts exhausted and no DLQ configured
    Exhausted { last_error: String },
    /// Attempts exhausted and the DLQ publish failed
    DlqPublish {
        error: PublishError,
        last_error: String,
    },
}

impl fmt::Display for FatalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalCause::Exhausted { last_error } => write!(f, "attempts exhausted: {}", last_error),
            FatalCause::DlqPublish { error, last_error } => {
                write!(f, "DLQ publish failed ({}) after: {}", error, last_error)
            }
        }
    }
}

/// Final result of processing one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded
    Success { attempts: u32 },
    /// Attempts were exhausted and the record now lives in the DLQ
    RoutedToDlq { attempts: u32, ack: DlqAck },
    /// The record could not be processed nor dead-lettered
    Fatal { attempts: u32, cause: FatalCause },
    /// Shutdown interrupted the retry sequence
    Abandoned { attempts: u32 },
}

impl Outcome {
    /// Handler invocations made
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Success { attempts }
            | Outcome::RoutedToDlq { attempts, .. }
            | Outcome::Fatal { attempts, .. }
            | Outcome::Abandoned { attempts } => *attempts,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal { .. })
    }
}

/// Runs a handler against one record under the retry policy
pub struct RecoveryExecutor {
    policy: RetryPolicy,
    router: Option<Arc<DeadLetterRouter>>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for RecoveryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryExecutor")
            .field("policy", &self.policy)
            .field("router", &self.router)
            .finish()
    }
}

impl RecoveryExecutor {
    /// `router` is `None` when the binding has no DLQ
    pub fn new(
        policy: RetryPolicy,
        router: Option<Arc<DeadLetterRouter>>,
        metrics: Arc<dyn MetricsSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            router,
            metrics,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `handler` until it succeeds, the attempts run out or a
    /// non-retryable error appears. The handler receives the 1-based attempt
    /// number. Backoff only suspends the calling task and is cut short by
    /// cancellation, which yields [`Outcome::Abandoned`].
    pub async fn process<F, Fut>(&self, record: &ConsumedRecord, handler: F) -> Outcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        self.process_while_owned(record, &CancellationToken::new(), handler)
            .await
    }

    /// Like [`process`](Self::process), but `revoked` fires when the
    /// partition's ownership ends. No attempt starts, no backoff completes
    /// and nothing is dead-lettered after that; the record is abandoned.
    pub async fn process_while_owned<F, Fut>(
        &self,
        record: &ConsumedRecord,
        revoked: &CancellationToken,
        mut handler: F,
    ) -> Outcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        let partition = record.partition();
        let offset = record.offset();
        let mut attempt = 0;

        loop {
            if revoked.is_cancelled() {
                return self.abandon(record, attempt, "Retry abandoned, partition revoked");
            }

            attempt += 1;
            let err = match handler(attempt).await {
                Ok(()) => {
                    self.metrics.record(ConsumerEvent::AttemptSucceeded {
                        partition: partition.clone(),
                        offset,
                        attempt,
                    });
                    return Outcome::Success { attempts: attempt };
                }
                Err(err) => err,
            };

            self.metrics.record(ConsumerEvent::AttemptFailed {
                partition: partition.clone(),
                offset,
                attempt,
                retryable: err.is_retryable(),
            });

            if !err.is_retryable() || !self.policy.allows_retry_after(attempt) {
                if revoked.is_cancelled() {
                    return self.abandon(record, attempt, "Exhausted record abandoned, partition revoked");
                }
                return self.exhausted(record, err, attempt).await;
            }

            warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset,
                attempt,
                error = %err,
                "Handler failed, retrying in {:?}",
                self.policy.interval
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.abandon(record, attempt, "Retry abandoned by shutdown");
                }
                _ = revoked.cancelled() => {
                    return self.abandon(record, attempt, "Retry abandoned, partition revoked");
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }

    fn abandon(&self, record: &ConsumedRecord, attempts: u32, message: &str) -> Outcome {
        let partition = record.partition();
        debug!(
            topic = partition.topic(),
            partition = partition.partition(),
            offset = record.offset(),
            attempts,
            "{}",
            message
        );
        self.metrics.record(ConsumerEvent::Abandoned {
            partition: partition.clone(),
            offset: record.offset(),
        });
        Outcome::Abandoned { attempts }
    }

    async fn exhausted(&self, record: &ConsumedRecord, err: AttemptError, attempts: u32) -> Outcome {
        let partition = record.partition();
        let offset = record.offset();

        let Some(router) = &self.router else {
            error!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset,
                attempts,
                error = %err,
                "Record failed with no DLQ configured"
            );
            return Outcome::Fatal {
                attempts,
                cause: FatalCause::Exhausted {
                    last_error: err.to_string(),
                },
            };
        };

        let context = FailedRecordContext::new(record.clone(), err.error(), attempts);
        match router.route(context).await {
            Ok(ack) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset,
                    attempts,
                    error = %err,
                    dlq_topic = router.destination(),
                    "Record routed to DLQ"
                );
                self.metrics.record(ConsumerEvent::RoutedToDlq {
                    partition: partition.clone(),
                    offset,
                    destination: router.destination().to_string(),
                });
                Outcome::RoutedToDlq { attempts, ack }
            }
            Err(publish_error) => {
                self.metrics.record(ConsumerEvent::DlqPublishFailed {
                    partition: partition.clone(),
                    offset,
                });
                Outcome::Fatal {
                    attempts,
                    cause: FatalCause::DlqPublish {
                        error: publish_error,
                        last_error: err.to_string(),
                    },
                }
            }
        }
    }
}
