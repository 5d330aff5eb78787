//! Per-partition workers and the record lifecycle they run
//!
//! Every partition gets its own lane: an unbounded queue drained by one task,
//! so records of a partition are handled strictly in order while a retrying
//! partition never holds up its siblings. Queue depth drives pause/resume on
//! the broker client.

use crate::consumer::assignment::{OwnershipToken, PartitionTracker};
use crate::consumer::commit::CommitCoordinator;
use crate::consumer::config::{BindingConfig, FatalAction};
use crate::consumer::converter::{MessageConverter, StandardHeaders, TrustedTypes};
use crate::consumer::error::ConsumerResult;
use crate::consumer::metrics::{ConsumerEvent, MetricsSink};
use crate::consumer::processor::{attempt, InboundMessage, MessageProcessor};
use crate::consumer::record::{ConsumedRecord, Partition};
use crate::consumer::retry::{AttemptError, FatalCause, Outcome, RecoveryExecutor};
use crate::consumer::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Broker-side flow control for one partition
pub trait PartitionFlow: Send + Sync {
    fn pause(&self, partition: &Partition) -> ConsumerResult<()>;
    fn resume(&self, partition: &Partition) -> ConsumerResult<()>;
}

/// Everything a worker needs to take one record from lease to commit
pub struct RecordPipeline<P: MessageProcessor> {
    processor: Arc<P>,
    tracker: Arc<PartitionTracker>,
    executor: RecoveryExecutor,
    coordinator: CommitCoordinator,
    converter: Arc<dyn MessageConverter>,
    trusted_types: TrustedTypes,
    standard_headers: StandardHeaders,
    fatal_action: FatalAction,
    shutdown: Arc<ShutdownState>,
    metrics: Arc<dyn MetricsSink>,
}

impl<P: MessageProcessor> RecordPipeline<P> {
    pub fn new(
        config: &BindingConfig,
        processor: Arc<P>,
        tracker: Arc<PartitionTracker>,
        executor: RecoveryExecutor,
        coordinator: CommitCoordinator,
        shutdown: Arc<ShutdownState>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            processor,
            tracker,
            executor,
            coordinator,
            converter: config.converter().clone(),
            trusted_types: config.trusted_types().clone(),
            standard_headers: config.policy().standard_headers,
            fatal_action: config.fatal_action(),
            shutdown,
            metrics,
        }
    }

    /// Run one record through lease, decode, retry and commit.
    ///
    /// Returns `None` when the ownership the record was dispatched under has
    /// ended; the record is discarded without commit.
    pub async fn handle(&self, token: &OwnershipToken, mut record: ConsumedRecord) -> Option<Outcome> {
        let offset = record.offset();
        let Some(lease) = self.tracker.lease_with(token, offset) else {
            debug!(
                topic = token.partition().topic(),
                partition = token.partition().partition(),
                offset,
                "Discarding record of a partition no longer owned"
            );
            return None;
        };

        self.standard_headers.apply(&mut record);

        let outcome = match self.converter.decode(&record, &self.trusted_types) {
            Ok(payload) => {
                let acknowledgment = self.coordinator.acknowledgment(lease.token(), offset);
                let message = InboundMessage::new(record.clone(), payload, acknowledgment);
                let processor = self.processor.as_ref();
                self.executor
                    .process_while_owned(&record, lease.revoked(), |_| attempt(processor, &message))
                    .await
            }
            // Conversion failures never succeed on retry
            Err(conversion_error) => {
                self.executor
                    .process_while_owned(&record, lease.revoked(), |_| {
                        let error = conversion_error.clone();
                        async move { Err(AttemptError::permanent(error)) }
                    })
                    .await
            }
        };

        if let Err(e) = self.coordinator.on_outcome(lease.token(), offset, &outcome) {
            error!(
                topic = token.partition().topic(),
                partition = token.partition().partition(),
                offset,
                error = %e,
                "Offset commit failed"
            );
        }

        if let Outcome::Fatal { cause, .. } = &outcome {
            self.escalate(token.partition(), offset, cause);
        }

        drop(lease);
        Some(outcome)
    }

    fn escalate(&self, partition: &Partition, offset: i64, cause: &FatalCause) {
        match self.fatal_action {
            FatalAction::Skip => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset,
                    cause = %cause,
                    "Skipping fatal record; offset left uncommitted"
                );
                self.metrics.record(ConsumerEvent::FatalSkip {
                    partition: partition.clone(),
                    offset,
                });
            }
            FatalAction::Stop => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset,
                    cause = %cause,
                    "Fatal record, stopping binding"
                );
                self.metrics.record(ConsumerEvent::FatalStop {
                    partition: partition.clone(),
                    offset,
                });
                self.shutdown.begin_shutdown(ShutdownReason::FatalRecord {
                    partition: partition.clone(),
                    offset,
                });
            }
        }
    }
}

struct QueuedRecord {
    token: OwnershipToken,
    record: ConsumedRecord,
}

struct Lane {
    tx: mpsc::UnboundedSender<QueuedRecord>,
    depth: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    /// Ownership generation of the last record queued
    generation: u64,
    handle: JoinHandle<()>,
}

/// Thresholds for per-partition flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowThresholds {
    pub pause_at: usize,
    pub resume_at: usize,
}

impl FlowThresholds {
    pub fn for_binding(config: &BindingConfig) -> Self {
        Self {
            pause_at: config.policy().pause_threshold,
            resume_at: config.policy().resume_threshold,
        }
    }
}

/// Routes records to per-partition lanes
pub struct Dispatcher<P: MessageProcessor> {
    pipeline: Arc<RecordPipeline<P>>,
    flow: Arc<dyn PartitionFlow>,
    thresholds: FlowThresholds,
    lanes: HashMap<Partition, Lane>,
}

impl<P: MessageProcessor> Dispatcher<P> {
    pub fn new(pipeline: Arc<RecordPipeline<P>>, flow: Arc<dyn PartitionFlow>, thresholds: FlowThresholds) -> Self {
        Self {
            pipeline,
            flow,
            thresholds,
            lanes: HashMap::new(),
        }
    }

    /// Queue a record on its partition's lane. Records of partitions this
    /// instance does not own are dropped.
    pub fn dispatch(&mut self, record: ConsumedRecord) -> ConsumerResult<()> {
        let partition = record.partition().clone();
        let Some(token) = self.pipeline.tracker.ownership(&partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition(),
                offset = record.offset(),
                "Dropping record of an unowned partition"
            );
            return Ok(());
        };

        if !self.lanes.contains_key(&partition) {
            let lane = self.spawn_lane(&partition, token.generation());
            self.lanes.insert(partition.clone(), lane);
        }
        let Some(lane) = self.lanes.get_mut(&partition) else {
            return Ok(());
        };

        // A reassigned partition starts unpaused on the client
        if lane.generation != token.generation() {
            lane.generation = token.generation();
            lane.paused.store(false, Ordering::Release);
        }

        let depth = lane.depth.fetch_add(1, Ordering::AcqRel) + 1;
        lane.tx.send(QueuedRecord { token, record })?;

        if depth >= self.thresholds.pause_at
            && lane
                .paused
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                depth,
                "Pausing partition"
            );
            if let Err(e) = self.flow.pause(&partition) {
                warn!(error = %e, "Failed to pause partition");
            }
            self.pipeline
                .metrics
                .record(ConsumerEvent::Paused { partition });
        }
        Ok(())
    }

    /// Queued records per partition
    pub fn depths(&self) -> HashMap<Partition, usize> {
        self.lanes
            .iter()
            .map(|(p, lane)| (p.clone(), lane.depth.load(Ordering::Acquire)))
            .collect()
    }

    fn spawn_lane(&self, partition: &Partition, generation: u64) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let paused = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_lane(
            partition.clone(),
            rx,
            self.pipeline.clone(),
            self.flow.clone(),
            self.thresholds,
            depth.clone(),
            paused.clone(),
        ));

        Lane {
            tx,
            depth,
            paused,
            generation,
            handle,
        }
    }

    /// Close every lane and wait up to `grace_period` for the workers
    pub async fn shutdown(self, grace_period: Duration) -> usize {
        let handles: Vec<JoinHandle<()>> = self
            .lanes
            .into_values()
            .map(|lane| {
                drop(lane.tx);
                lane.handle
            })
            .collect();
        ShutdownCoordinator::new(grace_period).drain(handles).await
    }
}

async fn run_lane<P: MessageProcessor>(
    partition: Partition,
    mut rx: mpsc::UnboundedReceiver<QueuedRecord>,
    pipeline: Arc<RecordPipeline<P>>,
    flow: Arc<dyn PartitionFlow>,
    thresholds: FlowThresholds,
    depth: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
) {
    debug!(
        topic = partition.topic(),
        partition = partition.partition(),
        "Partition worker started"
    );

    while let Some(queued) = rx.recv().await {
        if pipeline.shutdown.is_shutting_down() {
            break;
        }

        pipeline.handle(&queued.token, queued.record).await;

        let remaining = depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining <= thresholds.resume_at
            && paused
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                remaining,
                "Resuming partition"
            );
            if let Err(e) = flow.resume(&partition) {
                debug!(error = %e, "Failed to resume partition");
            }
            pipeline.metrics.record(ConsumerEvent::Resumed {
                partition: partition.clone(),
            });
        }
    }

    debug!(
        topic = partition.topic(),
        partition = partition.partition(),
        "Partition worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::assignment::OffsetSeeker;
    use crate::consumer::commit::OffsetCommitter;
    use crate::consumer::config::BindingConsumerPolicy;
    use crate::consumer::converter::ConverterRegistry;
    use crate::consumer::error::ConsumerError;
    use crate::consumer::metrics::ConsumerMetrics;
    use crate::consumer::offset_policy::{OffsetPolicyResolver, SeekAction};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct FakeBroker {
        commits: Mutex<Vec<(Partition, i64)>>,
        flow: Mutex<Vec<(&'static str, Partition)>>,
    }

    impl OffsetSeeker for FakeBroker {
        fn committed(
            &self,
            partitions: &[Partition],
        ) -> ConsumerResult<HashMap<Partition, Option<i64>>> {
            Ok(partitions.iter().map(|p| (p.clone(), None)).collect())
        }

        fn seek(&self, _partition: &Partition, _action: SeekAction) -> ConsumerResult<()> {
            Ok(())
        }
    }

    impl OffsetCommitter for FakeBroker {
        fn commit(&self, partition: &Partition, next_offset: i64) -> ConsumerResult<()> {
            self.commits.lock().push((partition.clone(), next_offset));
            Ok(())
        }
    }

    impl PartitionFlow for FakeBroker {
        fn pause(&self, partition: &Partition) -> ConsumerResult<()> {
            self.flow.lock().push(("pause", partition.clone()));
            Ok(())
        }

        fn resume(&self, partition: &Partition) -> ConsumerResult<()> {
            self.flow.lock().push(("resume", partition.clone()));
            Ok(())
        }
    }

    /// Handler gated by a semaphore so tests control when records complete
    struct GatedProcessor {
        gate: Arc<Semaphore>,
        fail: bool,
    }

    #[async_trait]
    impl MessageProcessor for GatedProcessor {
        type Error = ConsumerError;

        async fn process(&self, _message: &InboundMessage) -> Result<(), ConsumerError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| ConsumerError::ChannelError(e.to_string()))?;
            permit.forget();
            if self.fail {
                Err(ConsumerError::ProcessingError("nope".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        broker: Arc<FakeBroker>,
        tracker: Arc<PartitionTracker>,
        shutdown: Arc<ShutdownState>,
        dispatcher: Dispatcher<GatedProcessor>,
        gate: Arc<Semaphore>,
    }

    fn harness(policy: BindingConsumerPolicy, fail: bool, thresholds: FlowThresholds) -> Harness {
        let config = BindingConfig::resolve(
            "input",
            "orders",
            "g1",
            policy,
            &ConverterRegistry::with_defaults(),
        )
        .unwrap();
        let metrics: Arc<dyn MetricsSink> = Arc::new(ConsumerMetrics::new());
        let broker = Arc::new(FakeBroker::default());
        let tracker = Arc::new(PartitionTracker::new(
            OffsetPolicyResolver::new(None, false),
            metrics.clone(),
        ));
        let shutdown = Arc::new(ShutdownState::new());
        let gate = Arc::new(Semaphore::new(0));
        let processor = Arc::new(GatedProcessor {
            gate: gate.clone(),
            fail,
        });
        let executor = RecoveryExecutor::new(
            *config.retry_policy(),
            None,
            metrics.clone(),
            shutdown.token(),
        );
        let coordinator =
            CommitCoordinator::for_binding(&config, tracker.clone(), broker.clone(), metrics.clone());
        let pipeline = Arc::new(RecordPipeline::new(
            &config,
            processor,
            tracker.clone(),
            executor,
            coordinator,
            shutdown.clone(),
            metrics,
        ));
        let dispatcher = Dispatcher::new(pipeline, broker.clone(), thresholds);

        Harness {
            broker,
            tracker,
            shutdown,
            dispatcher,
            gate,
        }
    }

    fn record(partition: i32, offset: i64) -> ConsumedRecord {
        ConsumedRecord::new(Partition::new("orders", partition), offset).with_payload("{}")
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    const LOOSE: FlowThresholds = FlowThresholds {
        pause_at: 1000,
        resume_at: 100,
    };

    #[tokio::test]
    async fn test_records_commit_in_partition_order() {
        let policy = BindingConsumerPolicy::builder()
            .on_fatal(FatalAction::Skip)
            .build();
        let mut h = harness(policy, false, LOOSE);
        h.tracker.on_assigned(&[Partition::new("orders", 0)], h.broker.as_ref());

        for offset in 0..3 {
            h.dispatcher.dispatch(record(0, offset)).unwrap();
        }
        h.gate.add_permits(3);
        settle().await;

        let commits: Vec<i64> = h.broker.commits.lock().iter().map(|(_, o)| *o).collect();
        assert_eq!(commits, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unowned_partition_is_not_dispatched() {
        let policy = BindingConsumerPolicy::builder()
            .on_fatal(FatalAction::Skip)
            .build();
        let mut h = harness(policy, false, LOOSE);

        h.dispatcher.dispatch(record(4, 0)).unwrap();
        assert!(h.dispatcher.depths().is_empty());
    }

    #[tokio::test]
    async fn test_slow_partition_pauses_and_resumes() {
        let policy = BindingConsumerPolicy::builder()
            .on_fatal(FatalAction::Skip)
            .build();
        let thresholds = FlowThresholds {
            pause_at: 3,
            resume_at: 1,
        };
        let mut h = harness(policy, false, thresholds);
        let p0 = Partition::new("orders", 0);
        h.tracker.on_assigned(&[p0.clone()], h.broker.as_ref());

        for offset in 0..3 {
            h.dispatcher.dispatch(record(0, offset)).unwrap();
        }
        assert_eq!(*h.broker.flow.lock(), vec![("pause", p0.clone())]);

        h.gate.add_permits(2);
        settle().await;
        assert_eq!(
            *h.broker.flow.lock(),
            vec![("pause", p0.clone()), ("resume", p0.clone())]
        );
    }

    #[tokio::test]
    async fn test_reassigned_partition_pauses_again() {
        let policy = BindingConsumerPolicy::builder()
            .on_fatal(FatalAction::Skip)
            .build();
        let thresholds = FlowThresholds {
            pause_at: 2,
            resume_at: 0,
        };
        let mut h = harness(policy, false, thresholds);
        let p0 = Partition::new("orders", 0);
        h.tracker.on_assigned(&[p0.clone()], h.broker.as_ref());

        h.dispatcher.dispatch(record(0, 0)).unwrap();
        h.dispatcher.dispatch(record(0, 1)).unwrap();
        settle().await;
        assert_eq!(*h.broker.flow.lock(), vec![("pause", p0.clone())]);

        // The client forgets the pause across a rebalance
        h.tracker.on_revoked(&[p0.clone()], Duration::ZERO);
        h.tracker.on_assigned(&[p0.clone()], h.broker.as_ref());

        h.dispatcher.dispatch(record(0, 2)).unwrap();
        assert_eq!(
            *h.broker.flow.lock(),
            vec![("pause", p0.clone()), ("pause", p0.clone())]
        );
    }

    #[tokio::test]
    async fn test_fatal_stop_begins_shutdown() {
        let policy = BindingConsumerPolicy::builder()
            .on_fatal(FatalAction::Stop)
            .max_attempts(1)
            .build();
        let mut h = harness(policy, true, LOOSE);
        h.tracker.on_assigned(&[Partition::new("orders", 0)], h.broker.as_ref());

        h.dispatcher.dispatch(record(0, 0)).unwrap();
        h.gate.add_permits(1);
        settle().await;

        assert!(h.shutdown.is_shutting_down());
        assert!(matches!(h.shutdown.reason(), Some(ShutdownReason::FatalRecord { offset: 0, .. })));
        assert!(h.broker.commits.lock().is_empty());
        assert_eq!(h.dispatcher.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn test_revoked_while_queued_is_discarded() {
        let policy = BindingConsumerPolicy::builder()
            .on_fatal(FatalAction::Skip)
            .build();
        let mut h = harness(policy, false, LOOSE);
        let p0 = Partition::new("orders", 0);
        h.tracker.on_assigned(&[p0.clone()], h.broker.as_ref());

        h.dispatcher.dispatch(record(0, 0)).unwrap();
        h.dispatcher.dispatch(record(0, 1)).unwrap();
        settle().await;

        // First record is inside the handler, second still queued
        let tracker = h.tracker.clone();
        let report = tokio::task::spawn_blocking(move || tracker.on_revoked(&[p0], Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(report.abandoned.len(), 1);

        h.gate.add_permits(2);
        settle().await;
        assert!(h.broker.commits.lock().is_empty());
    }
}
