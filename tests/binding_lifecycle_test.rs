//! End-to-end record lifecycle against in-memory broker and DLQ fakes

use async_trait::async_trait;
use kafka_binder::consumer::dlq::{
    HEADER_ERROR_ATTEMPTS, HEADER_ERROR_MESSAGE, HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_PARTITION,
    HEADER_ORIGINAL_TOPIC,
};
use kafka_binder::consumer::{
    BindingConfig, BindingConsumerPolicy, CommitCoordinator, ConsumedRecord, ConsumerError,
    ConsumerMetrics, ConsumerResult, ConverterRegistry, DeadLetterRouter, DlqAck, DlqPublisher,
    DlqRecord, FatalAction, FatalCause, InboundMessage, MessageProcessor, MetricsSink,
    OffsetCommitter, OffsetPolicyResolver, OffsetSeeker, Outcome, Partition, PartitionTracker,
    PublishError, RecordPipeline, RecoveryExecutor, SeekAction, ShutdownState, StartOffset,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Group coordinator stand-in: committed offsets plus a log of seeks and commits
#[derive(Default)]
struct FakeBroker {
    committed: Mutex<HashMap<Partition, i64>>,
    commits: Mutex<Vec<(Partition, i64)>>,
    seeks: Mutex<Vec<(Partition, SeekAction)>>,
}

impl FakeBroker {
    fn commits(&self) -> Vec<(Partition, i64)> {
        self.commits.lock().clone()
    }
}

impl OffsetSeeker for FakeBroker {
    fn committed(&self, partitions: &[Partition]) -> ConsumerResult<HashMap<Partition, Option<i64>>> {
        let committed = self.committed.lock();
        Ok(partitions
            .iter()
            .map(|p| (p.clone(), committed.get(p).copied()))
            .collect())
    }

    fn seek(&self, partition: &Partition, action: SeekAction) -> ConsumerResult<()> {
        self.seeks.lock().push((partition.clone(), action));
        Ok(())
    }
}

impl OffsetCommitter for FakeBroker {
    fn commit(&self, partition: &Partition, next_offset: i64) -> ConsumerResult<()> {
        self.committed.lock().insert(partition.clone(), next_offset);
        self.commits.lock().push((partition.clone(), next_offset));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<DlqRecord>>,
    reject: bool,
}

#[async_trait]
impl DlqPublisher for RecordingPublisher {
    async fn publish(&self, record: DlqRecord, _timeout: Duration) -> Result<DlqAck, PublishError> {
        if self.reject {
            return Err(PublishError::Rejected {
                destination: record.topic,
                reason: "broker unavailable".into(),
            });
        }
        let mut published = self.published.lock();
        published.push(record);
        Ok(DlqAck {
            partition: 0,
            offset: published.len() as i64 - 1,
        })
    }
}

/// Fails the first `failures` calls, then succeeds
struct FlakyProcessor {
    failures: u32,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl FlakyProcessor {
    fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            gate: None,
        }
    }
}

#[async_trait]
impl MessageProcessor for FlakyProcessor {
    type Error = ConsumerError;

    async fn process(&self, _message: &InboundMessage) -> Result<(), ConsumerError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ConsumerError::ChannelError(e.to_string()))?
                .forget();
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(ConsumerError::ProcessingError(format!("attempt {} failed", call)))
        } else {
            Ok(())
        }
    }
}

struct Binding {
    config: BindingConfig,
    broker: Arc<FakeBroker>,
    publisher: Arc<RecordingPublisher>,
    tracker: Arc<PartitionTracker>,
    processor: Arc<FlakyProcessor>,
    pipeline: RecordPipeline<FlakyProcessor>,
    metrics: Arc<ConsumerMetrics>,
}

fn binding(policy: BindingConsumerPolicy, processor: FlakyProcessor, publisher: RecordingPublisher) -> Binding {
    let config = BindingConfig::resolve("orders-in", "orders", "g1", policy, &ConverterRegistry::with_defaults())
        .expect("valid binding");
    let metrics = Arc::new(ConsumerMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let broker = Arc::new(FakeBroker::default());
    let publisher = Arc::new(publisher);
    let shutdown = Arc::new(ShutdownState::new());

    let tracker = Arc::new(PartitionTracker::new(
        OffsetPolicyResolver::new(config.policy().start_offset, config.policy().reset_offsets),
        sink.clone(),
    ));
    let router = config
        .dlq_enabled()
        .then(|| Arc::new(DeadLetterRouter::for_binding(&config, publisher.clone())));
    let executor = RecoveryExecutor::new(*config.retry_policy(), router, sink.clone(), shutdown.token());
    let coordinator = CommitCoordinator::for_binding(&config, tracker.clone(), broker.clone(), sink.clone());
    let processor = Arc::new(processor);
    let pipeline = RecordPipeline::new(
        &config,
        processor.clone(),
        tracker.clone(),
        executor,
        coordinator,
        shutdown,
        sink,
    );

    tracker.on_assigned(&[orders(0)], broker.as_ref());

    Binding {
        config,
        broker,
        publisher,
        tracker,
        processor,
        pipeline,
        metrics,
    }
}

fn orders(partition: i32) -> Partition {
    Partition::new("orders", partition)
}

fn record(offset: i64) -> ConsumedRecord {
    ConsumedRecord::new(orders(0), offset)
        .with_key("order-7")
        .with_payload(r#"{"id":7}"#)
}

fn policy() -> BindingConsumerPolicy {
    BindingConsumerPolicy::builder()
        .recovery_interval(Duration::ZERO)
        .max_attempts(3)
        .on_fatal(FatalAction::Skip)
        .build()
}

impl Binding {
    async fn handle(&self, record: ConsumedRecord) -> Option<Outcome> {
        let token = self
            .tracker
            .ownership(record.partition())
            .expect("partition owned");
        self.pipeline.handle(&token, record).await
    }
}

#[test]
fn start_offset_reference_points() {
    let resolver = |start| OffsetPolicyResolver::new(start, false);

    assert_eq!(
        resolver(Some(StartOffset::Earliest)).resolve_start(&orders(0), None),
        SeekAction::SeekTo(StartOffset::Earliest)
    );
    assert_eq!(StartOffset::Earliest.reference_point(), -2);
    assert_eq!(
        resolver(Some(StartOffset::Latest)).resolve_start(&orders(0), None),
        SeekAction::SeekTo(StartOffset::Latest)
    );
    assert_eq!(StartOffset::Latest.reference_point(), -1);
    assert_eq!(resolver(None).resolve_start(&orders(0), None), SeekAction::GroupDefault);
}

#[test]
fn unset_start_offset_issues_no_seek() {
    let broker = FakeBroker::default();
    let tracker = PartitionTracker::new(
        OffsetPolicyResolver::new(None, false),
        Arc::new(ConsumerMetrics::new()),
    );

    let actions = tracker.on_assigned(&[orders(0), orders(1)], &broker);

    assert_eq!(actions.len(), 2);
    assert!(broker.seeks.lock().is_empty());
}

#[test]
fn earliest_start_offset_seeks_uncommitted_partitions_only() {
    let broker = FakeBroker::default();
    broker.committed.lock().insert(orders(1), 40);
    let tracker = PartitionTracker::new(
        OffsetPolicyResolver::new(Some(StartOffset::Earliest), false),
        Arc::new(ConsumerMetrics::new()),
    );

    tracker.on_assigned(&[orders(0), orders(1)], &broker);

    assert_eq!(
        *broker.seeks.lock(),
        vec![(orders(0), SeekAction::SeekTo(StartOffset::Earliest))]
    );
    assert_eq!(tracker.assignment(&orders(1)).map(|a| a.last_committed), Some(Some(40)));
}

#[tokio::test]
async fn success_on_retry_commits_once() {
    let b = binding(policy(), FlakyProcessor::failing(2), RecordingPublisher::default());

    let outcome = b.handle(record(10)).await;

    assert_eq!(outcome, Some(Outcome::Success { attempts: 3 }));
    assert_eq!(b.broker.commits(), vec![(orders(0), 11)]);
    assert_eq!(b.processor.calls.load(Ordering::SeqCst), 3);

    let snapshot = b.metrics.snapshot();
    assert_eq!(snapshot.attempts_failed, 2);
    assert_eq!(snapshot.attempts_succeeded, 1);
    assert_eq!(snapshot.commits, 1);
}

#[tokio::test]
async fn exhausted_record_is_dead_lettered_once_then_committed() {
    let policy = BindingConsumerPolicy::builder()
        .recovery_interval(Duration::ZERO)
        .max_attempts(3)
        .enable_dlq(true)
        .on_fatal(FatalAction::Stop)
        .build();
    let b = binding(policy, FlakyProcessor::failing(u32::MAX), RecordingPublisher::default());

    let outcome = b.handle(record(10)).await;

    assert!(matches!(outcome, Some(Outcome::RoutedToDlq { attempts: 3, .. })));
    let published = b.publisher.published.lock().clone();
    assert_eq!(published.len(), 1);

    let dead = &published[0];
    assert_eq!(dead.topic, "g1.orders.dlq");
    assert_eq!(dead.key.as_deref(), Some(&b"order-7"[..]));
    assert_eq!(dead.value.as_deref(), Some(&br#"{"id":7}"#[..]));
    assert_eq!(dead.header_str(HEADER_ORIGINAL_TOPIC), Some("orders"));
    assert_eq!(dead.header_str(HEADER_ORIGINAL_PARTITION), Some("0"));
    assert_eq!(dead.header_str(HEADER_ORIGINAL_OFFSET), Some("10"));
    assert_eq!(dead.header_str(HEADER_ERROR_ATTEMPTS), Some("3"));
    assert_eq!(
        dead.header_str(HEADER_ERROR_MESSAGE),
        Some("Processing error: attempt 3 failed")
    );

    assert_eq!(b.broker.commits(), vec![(orders(0), 11)]);
}

#[tokio::test]
async fn exhausted_without_dlq_is_fatal() {
    let b = binding(policy(), FlakyProcessor::failing(u32::MAX), RecordingPublisher::default());

    let outcome = b.handle(record(4)).await;

    assert!(matches!(
        outcome,
        Some(Outcome::Fatal {
            attempts: 3,
            cause: FatalCause::Exhausted { .. }
        })
    ));
    assert!(b.publisher.published.lock().is_empty());
    assert!(b.broker.commits().is_empty());
    assert_eq!(b.metrics.snapshot().fatal_skips, 1);
}

#[tokio::test]
async fn failed_dlq_publish_is_fatal_and_uncommitted() {
    let policy = BindingConsumerPolicy::builder()
        .recovery_interval(Duration::ZERO)
        .max_attempts(1)
        .enable_dlq(true)
        .on_fatal(FatalAction::Skip)
        .build();
    let publisher = RecordingPublisher {
        reject: true,
        ..Default::default()
    };
    let b = binding(policy, FlakyProcessor::failing(u32::MAX), publisher);

    let outcome = b.handle(record(4)).await;

    assert!(matches!(
        outcome,
        Some(Outcome::Fatal {
            cause: FatalCause::DlqPublish { .. },
            ..
        })
    ));
    assert!(b.broker.commits().is_empty());
    assert_eq!(b.metrics.snapshot().dlq_publish_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoked_partition_is_never_committed() {
    let gate = Arc::new(Semaphore::new(0));
    let processor = FlakyProcessor {
        failures: 0,
        calls: AtomicU32::new(0),
        gate: Some(gate.clone()),
    };
    let b = Arc::new(binding(policy(), processor, RecordingPublisher::default()));

    let worker = {
        let b = b.clone();
        tokio::spawn(async move { b.handle(record(20)).await })
    };
    while b.tracker.in_flight(&orders(0)) == 0 {
        tokio::task::yield_now().await;
    }

    let tracker = b.tracker.clone();
    let report = tokio::task::spawn_blocking(move || {
        tracker.on_revoked(&[orders(0)], Duration::from_millis(20))
    })
    .await
    .unwrap();
    assert_eq!(report.revoked, vec![orders(0)]);
    assert_eq!(report.abandoned, vec![(orders(0), 1)]);

    // the handler finishes after losing the partition
    gate.add_permits(1);
    let outcome = worker.await.unwrap();

    assert_eq!(outcome, Some(Outcome::Success { attempts: 1 }));
    assert!(b.broker.commits().is_empty());
    assert_eq!(b.metrics.snapshot().commits_dropped, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revocation_during_backoff_abandons_without_dead_lettering() {
    let policy = BindingConsumerPolicy::builder()
        .enable_dlq(true)
        .recovery_interval(Duration::from_millis(100))
        .max_attempts(5)
        .on_fatal(FatalAction::Skip)
        .build();
    let b = Arc::new(binding(policy, FlakyProcessor::failing(u32::MAX), RecordingPublisher::default()));

    let worker = {
        let b = b.clone();
        tokio::spawn(async move { b.handle(record(30)).await })
    };
    while b.processor.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let tracker = b.tracker.clone();
    let report = tokio::task::spawn_blocking(move || {
        tracker.on_revoked(&[orders(0)], Duration::from_millis(10))
    })
    .await
    .unwrap();
    assert_eq!(report.abandoned, vec![(orders(0), 1)]);

    let outcome = worker.await.unwrap();
    assert_eq!(outcome, Some(Outcome::Abandoned { attempts: 1 }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(b.processor.calls.load(Ordering::SeqCst), 1);
    assert!(b.publisher.published.lock().is_empty());
    assert!(b.broker.commits().is_empty());
    assert_eq!(b.metrics.snapshot().abandoned, 1);
}

#[test]
fn derived_dlq_destination() {
    let policy = BindingConsumerPolicy::builder()
        .enable_dlq(true)
        .recovery_interval(Duration::ZERO)
        .on_fatal(FatalAction::Stop)
        .build();
    let config = BindingConfig::resolve("orders-in", "orders", "g1", policy, &ConverterRegistry::with_defaults())
        .unwrap();

    assert_eq!(config.dlq_destination(), "g1.orders.dlq");
    assert_eq!(config.retry_policy().interval, Duration::ZERO);
}

/// With `autoCommitOnError: false` a dead-lettered record keeps its offset,
/// so reprocessing after a restart publishes it to the DLQ a second time.
/// The duplicate is accepted; both copies carry the same origin headers so
/// DLQ consumers can de-duplicate on topic, partition and offset.
#[tokio::test]
async fn dlq_without_commit_on_error_is_reprocessed() {
    let policy = BindingConsumerPolicy::builder()
        .recovery_interval(Duration::ZERO)
        .max_attempts(2)
        .enable_dlq(true)
        .auto_commit_on_error(false)
        .on_fatal(FatalAction::Stop)
        .build();
    let b = binding(policy, FlakyProcessor::failing(u32::MAX), RecordingPublisher::default());
    assert!(!b.config.commit_on_dlq());

    assert!(matches!(b.handle(record(8)).await, Some(Outcome::RoutedToDlq { .. })));
    assert!(b.broker.commits().is_empty());
    assert_eq!(b.broker.committed.lock().get(&orders(0)), None);

    // redelivery from the uncommitted position
    assert!(matches!(b.handle(record(8)).await, Some(Outcome::RoutedToDlq { .. })));

    let published = b.publisher.published.lock().clone();
    assert_eq!(published.len(), 2);
    for dead in &published {
        assert_eq!(dead.header_str(HEADER_ORIGINAL_OFFSET), Some("8"));
        assert_eq!(dead.header_str(HEADER_ORIGINAL_PARTITION), Some("0"));
    }
    assert!(b.broker.commits().is_empty());
}

#[test]
fn start_offset_resolution_is_idempotent() {
    let resolver = OffsetPolicyResolver::new(Some(StartOffset::Latest), true);
    for committed in [None, Some(0), Some(99)] {
        assert_eq!(
            resolver.resolve_start(&orders(3), committed),
            resolver.resolve_start(&orders(3), committed)
        );
    }
}

#[tokio::test]
async fn later_record_commits_after_earlier_fatal_skip() {
    let b = binding(policy(), FlakyProcessor::failing(3), RecordingPublisher::default());

    assert!(b.handle(record(0)).await.is_some_and(|o| o.is_fatal()));
    assert_eq!(b.handle(record(1)).await, Some(Outcome::Success { attempts: 1 }));

    assert_eq!(b.broker.commits(), vec![(orders(0), 2)]);
}
