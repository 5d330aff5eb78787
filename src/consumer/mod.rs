//! Kafka consumer binding
//!
//! A binding connects one destination topic and consumer group to an
//! application [`MessageProcessor`]:
//! - Offset policy on first assignment (`startOffset`, `resetOffsets`)
//! - Partition ownership tracking across rebalances
//! - Fixed-interval retry with dead-letter routing on exhaustion
//! - Ownership-checked offset commits, automatic or acknowledged
//! - Per-partition workers with pause/resume flow control
//! - Graceful shutdown
//!
//! # Example
//!
//! ```no_run
//! use kafka_binder::consumer::{
//!     BindingConfig, BindingConsumer, BindingConsumerPolicy, ConverterRegistry, ConsumerError,
//!     FatalAction, InboundMessage, MessageProcessor,
//! };
//! use async_trait::async_trait;
//!
//! struct Orders;
//!
//! #[async_trait]
//! impl MessageProcessor for Orders {
//!     type Error = ConsumerError;
//!
//!     async fn process(&self, message: &InboundMessage) -> Result<(), ConsumerError> {
//!         tracing::info!(offset = message.record().offset(), "order received");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let policy = BindingConsumerPolicy::builder()
//!     .enable_dlq(true)
//!     .max_attempts(3)
//!     .on_fatal(FatalAction::Stop)
//!     .build();
//! let config = BindingConfig::resolve(
//!     "orders-in",
//!     "orders",
//!     "order-service",
//!     policy,
//!     &ConverterRegistry::with_defaults(),
//! )?;
//!
//! let consumer = BindingConsumer::new("localhost:9092", config, Orders).await?;
//! let reason = consumer.run().await?;
//! tracing::info!(%reason, "binding stopped");
//! # Ok(())
//! # }
//! ```

pub mod assignment;
pub mod commit;
pub mod config;
pub mod consumer;
pub mod context;
pub mod converter;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod offset_policy;
pub mod processor;
pub mod record;
pub mod retry;
pub mod shutdown;

pub use assignment::{OffsetSeeker, OwnershipToken, PartitionAssignment, PartitionTracker, RevocationReport};
pub use commit::{Acknowledgment, CommitCoordinator, CommitDecision, OffsetCommitter, SkipReason};
pub use config::{
    BindingConfig, BindingConsumerPolicy, BindingConsumerPolicyBuilder, DlqPartitioning,
    DlqProducerPolicy, DlqValueFormat, FatalAction, StartOffset,
};
pub use consumer::{BindingConsumer, BindingHandle};
pub use context::BindingContext;
pub use converter::{ConverterRegistry, MessageConverter, Payload, StandardHeaders, TrustedTypes};
pub use dispatch::{Dispatcher, FlowThresholds, PartitionFlow, RecordPipeline};
pub use dlq::{DeadLetterRouter, DlqAck, DlqPublisher, DlqRecord, FailedRecordContext, KafkaDlqPublisher};
pub use error::{ConsumerError, ConsumerResult, ConversionError, ErrorSeverity, PublishError};
pub use metrics::{ConsumerEvent, ConsumerMetrics, MetricsSink, MetricsSnapshot, NoopSink, TracingSink};
pub use offset_policy::{OffsetPolicyResolver, SeekAction};
pub use processor::{InboundMessage, MessageProcessor};
pub use record::{ConsumedRecord, Partition, RecordHeader};
pub use retry::{AttemptError, FatalCause, Outcome, RecoveryExecutor, RetryPolicy};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownState};
