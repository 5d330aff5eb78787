//! rdkafka consumer context driving the partition tracker from rebalance callbacks

use crate::consumer::assignment::{OffsetSeeker, PartitionTracker};
use crate::consumer::error::ConsumerResult;
use crate::consumer::offset_policy::SeekAction;
use crate::consumer::record::Partition;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timeout for committed-offset lookups and seeks issued from callbacks
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer context for one binding.
///
/// Callbacks run on the thread polling the consumer, so record dispatch is
/// blocked for their whole duration.
pub struct BindingContext {
    binding: String,
    tracker: Arc<PartitionTracker>,
    drain_timeout: Duration,
}

impl BindingContext {
    pub fn new(binding: impl Into<String>, tracker: Arc<PartitionTracker>, drain_timeout: Duration) -> Self {
        Self {
            binding: binding.into(),
            tracker,
            drain_timeout,
        }
    }
}

impl ClientContext for BindingContext {}

impl ConsumerContext for BindingContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                if tpl.count() == 0 {
                    debug!(binding = %self.binding, "Skipping empty revoke");
                    return;
                }
                let partitions = partitions_of(tpl);
                let report = self.tracker.on_revoked(&partitions, self.drain_timeout);
                info!(
                    binding = %self.binding,
                    revoked = report.revoked.len(),
                    abandoned = report.abandoned.len(),
                    "Revocation handled"
                );
            }
            Rebalance::Assign(tpl) => {
                debug!(binding = %self.binding, count = tpl.count(), "Pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!(binding = %self.binding, error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            if tpl.count() == 0 {
                debug!(binding = %self.binding, "Skipping empty assign");
                return;
            }
            let partitions = partitions_of(tpl);
            let seeker = ClientSeeker {
                consumer: base_consumer,
            };
            let actions = self.tracker.on_assigned(&partitions, &seeker);
            info!(
                binding = %self.binding,
                assigned = actions.len(),
                "Assignment handled"
            );
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(binding = %self.binding, count = offsets.count(), "Offsets committed"),
            Err(e) => warn!(binding = %self.binding, error = %e, "Failed to commit offsets"),
        }
    }
}

/// Partitions named in a topic partition list
pub fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements().into_iter().map(Partition::from).collect()
}

/// Committed offsets as known by the group coordinator; negative or logical
/// offsets mean nothing is committed
pub(crate) fn fetch_committed<C, K>(
    consumer: &K,
    partitions: &[Partition],
) -> ConsumerResult<HashMap<Partition, Option<i64>>>
where
    C: ConsumerContext + 'static,
    K: Consumer<C>,
{
    let mut tpl = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition());
    }

    let committed = consumer.committed_offsets(tpl, CALLBACK_TIMEOUT)?;
    Ok(committed
        .elements()
        .into_iter()
        .map(|elem| {
            let offset = match elem.offset() {
                Offset::Offset(offset) if offset >= 0 => Some(offset),
                _ => None,
            };
            (Partition::from(elem), offset)
        })
        .collect())
}

/// Seeker over the consumer handed to rebalance callbacks
struct ClientSeeker<'a, C: ConsumerContext + 'static> {
    consumer: &'a BaseConsumer<C>,
}

impl<C: ConsumerContext + 'static> OffsetSeeker for ClientSeeker<'_, C> {
    fn committed(&self, partitions: &[Partition]) -> ConsumerResult<HashMap<Partition, Option<i64>>> {
        fetch_committed::<C, _>(self.consumer, partitions)
    }

    fn seek(&self, partition: &Partition, action: SeekAction) -> ConsumerResult<()> {
        if let Some(offset) = action.to_offset() {
            self.consumer
                .seek(partition.topic(), partition.partition(), offset, CALLBACK_TIMEOUT)?;
        }
        Ok(())
    }
}
