//! Per-attempt and per-outcome observability

use crate::consumer::record::Partition;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Something the binding did that operators may want to count
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// A handler invocation failed
    AttemptFailed {
        partition: Partition,
        offset: i64,
        attempt: u32,
        retryable: bool,
    },
    /// A handler invocation succeeded
    AttemptSucceeded {
        partition: Partition,
        offset: i64,
        attempt: u32,
    },
    /// An exhausted record was published to the dead-letter topic
    RoutedToDlq {
        partition: Partition,
        offset: i64,
        destination: String,
    },
    /// Publishing to the dead-letter topic failed
    DlqPublishFailed { partition: Partition, offset: i64 },
    /// A fatal record was skipped without commit
    FatalSkip { partition: Partition, offset: i64 },
    /// A fatal record stopped the binding
    FatalStop { partition: Partition, offset: i64 },
    /// Offset committed
    Committed { partition: Partition, next_offset: i64 },
    /// Commit dropped because the partition was revoked
    CommitDropped { partition: Partition, offset: i64 },
    /// Commit intentionally not issued
    CommitSkipped { partition: Partition, offset: i64 },
    /// In-flight work abandoned by revocation or shutdown
    Abandoned { partition: Partition, offset: i64 },
    /// Partition assignment changed
    Rebalanced { assigned: usize, revoked: usize },
    /// Partition paused for flow control
    Paused { partition: Partition },
    /// Partition resumed after draining
    Resumed { partition: Partition },
}

/// Fire-and-forget event sink; implementations must not block
pub trait MetricsSink: Send + Sync + Debug {
    fn record(&self, event: ConsumerEvent);
}

/// Sink that drops every event
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _event: ConsumerEvent) {}
}

/// Sink that turns every event into a structured log line
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: ConsumerEvent) {
        match event {
            ConsumerEvent::AttemptFailed {
                partition,
                offset,
                attempt,
                retryable,
            } => warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset,
                attempt,
                retryable,
                "Handler attempt failed"
            ),
            ConsumerEvent::FatalSkip { partition, offset } => error!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset,
                "Fatal record skipped without commit"
            ),
            ConsumerEvent::FatalStop { partition, offset } => error!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset,
                "Fatal record stopped the binding"
            ),
            ConsumerEvent::DlqPublishFailed { partition, offset } => error!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset,
                "Dead letter publish failed"
            ),
            ConsumerEvent::Rebalanced { assigned, revoked } => {
                info!(assigned, revoked, "Partition assignment changed")
            }
            other => debug!(event = ?other, "Consumer event"),
        }
    }
}

/// Counter-based sink
#[derive(Debug)]
pub struct ConsumerMetrics {
    attempts_failed: AtomicU64,
    attempts_succeeded: AtomicU64,
    routed_to_dlq: AtomicU64,
    dlq_publish_failures: AtomicU64,
    fatal_skips: AtomicU64,
    fatal_stops: AtomicU64,
    commits: AtomicU64,
    commits_dropped: AtomicU64,
    commits_skipped: AtomicU64,
    abandoned: AtomicU64,
    rebalances: AtomicU64,
    pauses: AtomicU64,
    /// Last committed offset per partition
    committed_offsets: RwLock<BTreeMap<Partition, i64>>,
    start_time: Instant,
}

impl ConsumerMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            attempts_failed: AtomicU64::new(0),
            attempts_succeeded: AtomicU64::new(0),
            routed_to_dlq: AtomicU64::new(0),
            dlq_publish_failures: AtomicU64::new(0),
            fatal_skips: AtomicU64::new(0),
            fatal_stops: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            commits_dropped: AtomicU64::new(0),
            commits_skipped: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            rebalances: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
            committed_offsets: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
            attempts_succeeded: self.attempts_succeeded.load(Ordering::Relaxed),
            routed_to_dlq: self.routed_to_dlq.load(Ordering::Relaxed),
            dlq_publish_failures: self.dlq_publish_failures.load(Ordering::Relaxed),
            fatal_skips: self.fatal_skips.load(Ordering::Relaxed),
            fatal_stops: self.fatal_stops.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commits_dropped: self.commits_dropped.load(Ordering::Relaxed),
            commits_skipped: self.commits_skipped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            committed_offsets: self
                .committed_offsets
                .read()
                .iter()
                .map(|(p, o)| (p.to_string(), *o))
                .collect(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for ConsumerMetrics {
    fn record(&self, event: ConsumerEvent) {
        let counter = match &event {
            ConsumerEvent::AttemptFailed { .. } => &self.attempts_failed,
            ConsumerEvent::AttemptSucceeded { .. } => &self.attempts_succeeded,
            ConsumerEvent::RoutedToDlq { .. } => &self.routed_to_dlq,
            ConsumerEvent::DlqPublishFailed { .. } => &self.dlq_publish_failures,
            ConsumerEvent::FatalSkip { .. } => &self.fatal_skips,
            ConsumerEvent::FatalStop { .. } => &self.fatal_stops,
            ConsumerEvent::Committed {
                partition,
                next_offset,
            } => {
                self.committed_offsets
                    .write()
                    .insert(partition.clone(), *next_offset);
                &self.commits
            }
            ConsumerEvent::CommitDropped { .. } => &self.commits_dropped,
            ConsumerEvent::CommitSkipped { .. } => &self.commits_skipped,
            ConsumerEvent::Abandoned { .. } => &self.abandoned,
            ConsumerEvent::Rebalanced { .. } => &self.rebalances,
            ConsumerEvent::Paused { .. } => &self.pauses,
            ConsumerEvent::Resumed { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fans events out to several sinks
#[derive(Debug, Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for CompositeSink {
    fn record(&self, event: ConsumerEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

/// Point-in-time view of [`ConsumerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub attempts_failed: u64,
    pub attempts_succeeded: u64,
    pub routed_to_dlq: u64,
    pub dlq_publish_failures: u64,
    pub fatal_skips: u64,
    pub fatal_stops: u64,
    pub commits: u64,
    pub commits_dropped: u64,
    pub commits_skipped: u64,
    pub abandoned: u64,
    pub rebalances: u64,
    pub pauses: u64,
    /// Last committed offset keyed by `topic-partition`
    pub committed_offsets: BTreeMap<String, i64>,
    pub uptime_secs: u64,
}
