//! Binding consumer: wires the tracker, retry executor, DLQ router and commit
//! coordinator onto an rdkafka `StreamConsumer`

use crate::consumer::assignment::{OffsetSeeker, PartitionTracker};
use crate::consumer::commit::{CommitCoordinator, OffsetCommitter};
use crate::consumer::config::BindingConfig;
use crate::consumer::context::{fetch_committed, BindingContext};
use crate::consumer::dispatch::{Dispatcher, FlowThresholds, PartitionFlow, RecordPipeline};
use crate::consumer::dlq::{DeadLetterRouter, KafkaDlqPublisher};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::metrics::{CompositeSink, ConsumerMetrics, MetricsSink, TracingSink};
use crate::consumer::offset_policy::{OffsetPolicyResolver, SeekAction};
use crate::consumer::processor::MessageProcessor;
use crate::consumer::record::{ConsumedRecord, Partition};
use crate::consumer::retry::RecoveryExecutor;
use crate::consumer::shutdown::{ShutdownReason, ShutdownState};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timeout for metadata lookups and topic provisioning at startup
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

type BindingStream = StreamConsumer<BindingContext>;

/// A running consumer for one binding
pub struct BindingConsumer<P: MessageProcessor> {
    config: Arc<BindingConfig>,
    consumer: Arc<BindingStream>,
    tracker: Arc<PartitionTracker>,
    dispatcher: Dispatcher<P>,
    metrics: Arc<ConsumerMetrics>,
    shutdown: Arc<ShutdownState>,
}

impl<P: MessageProcessor> BindingConsumer<P> {
    /// Create the consumer, verify the DLQ destination when enabled, and
    /// subscribe (or pin partitions when rebalancing is disabled)
    pub async fn new(brokers: &str, config: BindingConfig, processor: P) -> ConsumerResult<Self> {
        let config = Arc::new(config);
        let policy = config.policy();

        let metrics = Arc::new(ConsumerMetrics::new());
        let sink: Arc<dyn MetricsSink> = Arc::new(CompositeSink::new(vec![
            metrics.clone() as Arc<dyn MetricsSink>,
            Arc::new(TracingSink),
        ]));

        let resolver = OffsetPolicyResolver::new(policy.start_offset, policy.reset_offsets);
        let tracker = Arc::new(PartitionTracker::new(resolver, sink.clone()));

        let context = BindingContext::new(
            config.binding(),
            tracker.clone(),
            policy.revocation_drain_timeout,
        );
        let consumer: BindingStream = config
            .consumer_client_config(brokers)
            .create_with_context(context)
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to create consumer: {}", e)))?;
        let consumer = Arc::new(consumer);

        let shutdown = Arc::new(ShutdownState::new());

        let router = if config.dlq_enabled() {
            let producer = prepare_dlq(&config, brokers).await?;
            info!(
                binding = config.binding(),
                destination = config.dlq_destination(),
                "Created DLQ producer"
            );
            Some(Arc::new(DeadLetterRouter::for_binding(
                &config,
                Arc::new(KafkaDlqPublisher::new(producer)),
            )))
        } else {
            None
        };

        let executor = RecoveryExecutor::new(
            *config.retry_policy(),
            router,
            sink.clone(),
            shutdown.token(),
        );
        let committer: Arc<dyn OffsetCommitter> = Arc::new(KafkaCommitter {
            consumer: consumer.clone(),
        });
        let coordinator = CommitCoordinator::for_binding(&config, tracker.clone(), committer, sink.clone());

        let pipeline = Arc::new(RecordPipeline::new(
            &config,
            Arc::new(processor),
            tracker.clone(),
            executor,
            coordinator,
            shutdown.clone(),
            sink,
        ));
        let flow: Arc<dyn PartitionFlow> = Arc::new(KafkaFlow {
            consumer: consumer.clone(),
        });
        let dispatcher = Dispatcher::new(pipeline, flow, FlowThresholds::for_binding(&config));

        if policy.auto_rebalance_enabled {
            consumer
                .subscribe(&[config.destination()])
                .map_err(|e| ConsumerError::ConnectionError(format!("Failed to subscribe: {}", e)))?;
            info!(
                binding = config.binding(),
                destination = config.destination(),
                group = config.group(),
                "Subscribed"
            );
        } else {
            let assigner = consumer.clone();
            let pinned_tracker = tracker.clone();
            let pinned_config = config.clone();
            tokio::task::spawn_blocking(move || assign_pinned(&assigner, &pinned_tracker, &pinned_config))
                .await
                .map_err(|e| ConsumerError::ConnectionError(format!("Manual assignment task failed: {}", e)))??;
        }

        Ok(Self {
            config,
            consumer,
            tracker,
            dispatcher,
            metrics,
            shutdown,
        })
    }

    /// Handle for stopping the binding from another task
    pub fn handle(&self) -> BindingHandle {
        BindingHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Partitions currently owned by this binding
    pub fn assignment(&self) -> BTreeSet<Partition> {
        self.tracker.current_assignment()
    }

    /// Dispatch records until shutdown is requested or a fatal record stops
    /// the binding, then drain the partition workers.
    pub async fn run(mut self) -> ConsumerResult<ShutdownReason> {
        info!(
            binding = self.config.binding(),
            destination = self.config.destination(),
            "Starting binding consumer"
        );

        let token = self.shutdown.token();
        let reporter = self.spawn_metrics_reporter();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = self.consumer.recv() => match message {
                    Ok(message) => {
                        let record = ConsumedRecord::from_message(&message);
                        if let Err(e) = self.dispatcher.dispatch(record) {
                            error!(error = %e, "Partition worker gone, stopping binding");
                            self.shutdown.begin_shutdown(ShutdownReason::StreamClosed);
                        }
                    }
                    Err(e) => {
                        warn!(binding = self.config.binding(), error = %e, "Error receiving from broker");
                    }
                }
            }
        }

        let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Requested);
        info!(binding = self.config.binding(), reason = %reason, "Draining partition workers");

        let aborted = self
            .dispatcher
            .shutdown(self.config.policy().shutdown_grace_period)
            .await;
        if aborted > 0 {
            warn!(binding = self.config.binding(), aborted, "Partition workers aborted");
        }

        if let Err(e) = reporter.await {
            debug!(error = %e, "Metrics reporter ended abnormally");
        }

        if self.config.policy().auto_rebalance_enabled {
            self.consumer.unsubscribe();
        }
        self.shutdown.complete_shutdown();

        match serde_json::to_string(&self.metrics.snapshot()) {
            Ok(snapshot) => info!(binding = self.config.binding(), snapshot = %snapshot, "Binding stopped"),
            Err(e) => debug!(error = %e, "Failed to serialize final metrics"),
        }
        Ok(reason)
    }

    fn spawn_metrics_reporter(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let interval = self.config.policy().metrics_interval;
        let binding = self.config.binding().to_string();
        let token = self.shutdown.token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot();
                        info!(
                            binding = %binding,
                            succeeded = snapshot.attempts_succeeded,
                            failed = snapshot.attempts_failed,
                            dlq = snapshot.routed_to_dlq,
                            commits = snapshot.commits,
                            abandoned = snapshot.abandoned,
                            "Binding stats"
                        );
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}

/// Cloneable handle that stops a running [`BindingConsumer`]
#[derive(Debug, Clone)]
pub struct BindingHandle {
    shutdown: Arc<ShutdownState>,
}

impl BindingHandle {
    pub fn shutdown(&self) {
        self.shutdown.begin_shutdown(ShutdownReason::Requested);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }
}

/// Commits through the consumer group coordinator
struct KafkaCommitter {
    consumer: Arc<BindingStream>,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit(&self, partition: &Partition, next_offset: i64) -> ConsumerResult<()> {
        let mut tpl = TopicPartitionList::with_capacity(1);
        tpl.add_partition_offset(partition.topic(), partition.partition(), Offset::Offset(next_offset))?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }
}

/// Pause/resume on the broker client
struct KafkaFlow {
    consumer: Arc<BindingStream>,
}

impl KafkaFlow {
    fn single(partition: &Partition) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::with_capacity(1);
        tpl.add_partition(partition.topic(), partition.partition());
        tpl
    }
}

impl PartitionFlow for KafkaFlow {
    fn pause(&self, partition: &Partition) -> ConsumerResult<()> {
        self.consumer.pause(&Self::single(partition))?;
        Ok(())
    }

    fn resume(&self, partition: &Partition) -> ConsumerResult<()> {
        self.consumer.resume(&Self::single(partition))?;
        Ok(())
    }
}

/// Seeker used when pinning partitions: the seek positions are folded into
/// the `assign` call instead of being issued one by one
struct PlanningSeeker<'a> {
    consumer: &'a BindingStream,
}

impl OffsetSeeker for PlanningSeeker<'_> {
    fn committed(&self, partitions: &[Partition]) -> ConsumerResult<HashMap<Partition, Option<i64>>> {
        fetch_committed::<BindingContext, _>(self.consumer, partitions)
    }

    fn seek(&self, _partition: &Partition, _action: SeekAction) -> ConsumerResult<()> {
        Ok(())
    }
}

/// Partition numbers this instance owns out of `partition_count`
pub fn pinned_partitions(partition_count: i32, instance_index: u32, instance_count: u32) -> Vec<i32> {
    (0..partition_count)
        .filter(|p| (*p as u32) % instance_count == instance_index)
        .collect()
}

fn assign_pinned(
    consumer: &BindingStream,
    tracker: &PartitionTracker,
    config: &BindingConfig,
) -> ConsumerResult<()> {
    let destination = config.destination();
    let metadata = consumer.fetch_metadata(Some(destination), METADATA_TIMEOUT)?;
    let topic = metadata
        .topics()
        .iter()
        .find(|t| t.name() == destination && t.error().is_none())
        .ok_or_else(|| ConsumerError::ConfigError(format!("Destination '{}' not found", destination)))?;

    let policy = config.policy();
    let partitions: Vec<Partition> = pinned_partitions(
        topic.partitions().len() as i32,
        policy.instance_index,
        policy.instance_count,
    )
    .into_iter()
    .map(|p| Partition::new(destination, p))
    .collect();

    if partitions.is_empty() {
        warn!(
            binding = config.binding(),
            instance_index = policy.instance_index,
            instance_count = policy.instance_count,
            "No partitions selected for this instance"
        );
        return Ok(());
    }

    let actions = tracker.on_assigned(&partitions, &PlanningSeeker { consumer });
    let mut tpl = TopicPartitionList::with_capacity(actions.len());
    for (partition, action) in &actions {
        tpl.add_partition_offset(partition.topic(), partition.partition(), action.to_assign_offset())?;
    }
    consumer.assign(&tpl)?;

    info!(
        binding = config.binding(),
        partitions = ?partitions.iter().map(Partition::partition).collect::<Vec<_>>(),
        "Pinned partitions assigned"
    );
    Ok(())
}

/// Create the DLQ producer and make sure its destination exists, creating it
/// when a partition count is configured
async fn prepare_dlq(config: &BindingConfig, brokers: &str) -> ConsumerResult<FutureProducer> {
    let client_config = config.dlq_client_config(brokers);
    let producer: FutureProducer = client_config
        .create()
        .map_err(|e| ConsumerError::ConnectionError(format!("Failed to create DLQ producer: {}", e)))?;

    let destination = config.dlq_destination().to_string();
    let producer_policy = &config.policy().dlq_producer_policy;
    if let Some(partition_count) = producer_policy.partition_count {
        let admin: AdminClient<DefaultClientContext> = client_config
            .create()
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to create admin client: {}", e)))?;
        let replication = producer_policy.replication_factor.unwrap_or(1);
        let topic = NewTopic::new(&destination, partition_count, TopicReplication::Fixed(replication));
        let options = AdminOptions::new().operation_timeout(Some(METADATA_TIMEOUT));

        for result in admin.create_topics(&[topic], &options).await? {
            match result {
                Ok(name) => info!(topic = %name, partition_count, replication, "Provisioned DLQ topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "DLQ topic already exists")
                }
                Err((name, code)) => {
                    return Err(ConsumerError::ConfigError(format!(
                        "Failed to provision DLQ topic '{}': {}",
                        name, code
                    )))
                }
            }
        }
    }

    let probe = producer.clone();
    let topic = destination.clone();
    let available = tokio::task::spawn_blocking(move || {
        probe
            .client()
            .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
            .map(|metadata| {
                metadata
                    .topics()
                    .iter()
                    .any(|t| t.name() == topic && t.error().is_none())
            })
    })
    .await
    .map_err(|e| ConsumerError::ConnectionError(format!("DLQ metadata probe failed: {}", e)))?
    .map_err(|e| ConsumerError::ConnectionError(format!("DLQ destination '{}' unreachable: {}", destination, e)))?;

    if !available {
        return Err(ConsumerError::ConfigError(format!(
            "DLQ destination '{}' does not exist",
            destination
        )));
    }
    Ok(producer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(6, 0, 2, vec![0, 2, 4])]
    #[case(6, 1, 2, vec![1, 3, 5])]
    #[case(4, 2, 3, vec![2])]
    #[case(2, 0, 1, vec![0, 1])]
    #[case(0, 0, 1, vec![])]
    fn test_pinned_partitions(
        #[case] count: i32,
        #[case] index: u32,
        #[case] instances: u32,
        #[case] expected: Vec<i32>,
    ) {
        assert_eq!(pinned_partitions(count, index, instances), expected);
    }

    #[test]
    fn test_handle_requests_shutdown() {
        let shutdown = Arc::new(ShutdownState::new());
        let handle = BindingHandle {
            shutdown: shutdown.clone(),
        };

        handle.clone().shutdown();

        assert!(handle.is_shutting_down());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    }
}
