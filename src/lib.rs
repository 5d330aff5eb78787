//! Kafka consumer binding layer
//!
//! Connects a destination topic and consumer group to an application handler,
//! taking care of the parts every consumer gets wrong on its own: where to
//! start reading, which partitions are still ours after a rebalance, retrying
//! failed records, dead-letter routing, and committing offsets only for
//! partitions we still own.
//!
//! # Example
//!
//! ```no_run
//! use kafka_binder::config::BinderConfig;
//! use kafka_binder::consumer::{
//!     BindingConsumer, ConsumerError, ConverterRegistry, InboundMessage, MessageProcessor,
//! };
//! use async_trait::async_trait;
//!
//! struct Audit;
//!
//! #[async_trait]
//! impl MessageProcessor for Audit {
//!     type Error = ConsumerError;
//!
//!     async fn process(&self, message: &InboundMessage) -> Result<(), ConsumerError> {
//!         tracing::info!(payload = ?message.payload(), "audit event");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let binder = BinderConfig::load("binder.yml")?;
//! let binding = binder.binding("audit-in", &ConverterRegistry::with_defaults())?;
//!
//! let consumer = BindingConsumer::new(&binder.brokers, binding, Audit).await?;
//! let handle = consumer.handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     handle.shutdown();
//! });
//! consumer.run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_inception)]

/// Binder settings file
pub mod config;

/// Consumer binding: offsets, assignment, retry, dead-letter routing, commits
pub mod consumer;

/// Logging and OpenTelemetry initialisation
pub mod telemetry;

pub use config::BinderConfig;
pub use consumer::{BindingConfig, BindingConsumer, ConsumerError, ConsumerResult, MessageProcessor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
