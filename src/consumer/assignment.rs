//! Partition ownership tracking across rebalances

use crate::consumer::commit::{CommitDecision, OffsetCommitter, SkipReason};
use crate::consumer::error::ConsumerResult;
use crate::consumer::metrics::{ConsumerEvent, MetricsSink};
use crate::consumer::offset_policy::{OffsetPolicyResolver, SeekAction};
use crate::consumer::record::Partition;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll interval while waiting for in-flight work on revoked partitions
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Broker-side operations the tracker needs when partitions arrive
pub trait OffsetSeeker {
    /// Committed offsets for the given partitions, `None` where nothing is committed
    fn committed(&self, partitions: &[Partition]) -> ConsumerResult<HashMap<Partition, Option<i64>>>;

    /// Reposition a partition
    fn seek(&self, partition: &Partition, action: SeekAction) -> ConsumerResult<()>;
}

/// State of one owned partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub partition: Partition,
    /// Distinguishes successive ownerships of the same partition
    pub generation: u64,
    /// Last offset committed by this instance (or found committed on assignment)
    pub last_committed: Option<i64>,
    /// Offset of the next record expected from the broker
    pub next_expected: Option<i64>,
    /// How the start position was resolved
    pub seek: SeekAction,
}

/// Proof that a record was dispatched while a given ownership was live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnershipToken {
    partition: Partition,
    generation: u64,
}

impl OwnershipToken {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Marks one record as in flight until dropped
#[derive(Debug)]
pub struct PartitionLease {
    token: OwnershipToken,
    offset: i64,
    in_flight: Arc<AtomicUsize>,
    revoked: CancellationToken,
}

impl PartitionLease {
    pub fn token(&self) -> &OwnershipToken {
        &self.token
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Cancelled when the ownership this lease was taken under ends
    pub fn revoked(&self) -> &CancellationToken {
        &self.revoked
    }
}

impl Drop for PartitionLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Result of a revocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationReport {
    /// Partitions whose state was discarded
    pub revoked: Vec<Partition>,
    /// Partitions still holding in-flight records when the drain timed out
    pub abandoned: Vec<(Partition, usize)>,
}

#[derive(Debug)]
struct PartitionState {
    assignment: PartitionAssignment,
    in_flight: Arc<AtomicUsize>,
    revoked: CancellationToken,
}

#[derive(Debug, Default)]
struct TrackerState {
    partitions: HashMap<Partition, PartitionState>,
    /// Every partition ever assigned in this process
    seen: HashSet<Partition>,
    next_generation: u64,
}

/// Single source of truth for "do I still own this partition".
///
/// Ownership checks and commits happen under the same lock, so a commit can
/// never interleave with the revocation of its partition.
pub struct PartitionTracker {
    resolver: OffsetPolicyResolver,
    state: Mutex<TrackerState>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for PartitionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionTracker")
            .field("resolver", &self.resolver)
            .field("assignment", &self.current_assignment())
            .finish()
    }
}

impl PartitionTracker {
    pub fn new(resolver: OffsetPolicyResolver, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            resolver,
            state: Mutex::new(TrackerState::default()),
            metrics,
        }
    }

    /// Take ownership of newly assigned partitions, resolve where each starts
    /// and issue the seeks that resolution requires. Partitions already owned
    /// are left untouched.
    pub fn on_assigned(
        &self,
        partitions: &[Partition],
        seeker: &dyn OffsetSeeker,
    ) -> Vec<(Partition, SeekAction)> {
        let fresh: Vec<Partition> = {
            let state = self.state.lock();
            partitions
                .iter()
                .filter(|p| !state.partitions.contains_key(*p))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Vec::new();
        }

        let committed = match seeker.committed(&fresh) {
            Ok(committed) => Some(committed),
            Err(e) => {
                warn!(error = %e, "Failed to fetch committed offsets, deferring to group defaults");
                None
            }
        };

        let mut actions = Vec::with_capacity(fresh.len());
        {
            let mut state = self.state.lock();
            for partition in fresh {
                let action = match &committed {
                    Some(committed) => {
                        let offset = committed.get(&partition).copied().flatten();
                        if state.seen.contains(&partition) {
                            self.resolver.resolve_reassigned(&partition, offset)
                        } else {
                            self.resolver.resolve_start(&partition, offset)
                        }
                    }
                    None => SeekAction::GroupDefault,
                };
                let last_committed = match action {
                    SeekAction::Resume { offset } => Some(offset),
                    _ => None,
                };

                state.next_generation += 1;
                let generation = state.next_generation;
                state.seen.insert(partition.clone());
                state.partitions.insert(
                    partition.clone(),
                    PartitionState {
                        assignment: PartitionAssignment {
                            partition: partition.clone(),
                            generation,
                            last_committed,
                            next_expected: last_committed,
                            seek: action,
                        },
                        in_flight: Arc::new(AtomicUsize::new(0)),
                        revoked: CancellationToken::new(),
                    },
                );
                actions.push((partition, action));
            }
        }

        for (partition, action) in &actions {
            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                action = ?action,
                "Partition assigned"
            );
            if action.requires_seek() {
                if let Err(e) = seeker.seek(partition, *action) {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        error = %e,
                        "Failed to seek newly assigned partition"
                    );
                }
            }
        }

        self.metrics.record(ConsumerEvent::Rebalanced {
            assigned: actions.len(),
            revoked: 0,
        });
        actions
    }

    /// Discard state for revoked partitions, then wait up to `drain_timeout`
    /// for their in-flight records. Outstanding tokens are invalid from the
    /// moment the state is gone, whether or not the drain completes, and
    /// every lease taken under them sees its revocation token fire.
    pub fn on_revoked(&self, partitions: &[Partition], drain_timeout: Duration) -> RevocationReport {
        let draining: Vec<(Partition, Arc<AtomicUsize>)> = {
            let mut state = self.state.lock();
            partitions
                .iter()
                .filter_map(|p| {
                    state.partitions.remove(p).map(|s| {
                        s.revoked.cancel();
                        (p.clone(), s.in_flight)
                    })
                })
                .collect()
        };

        let deadline = Instant::now() + drain_timeout;
        while draining.iter().any(|(_, n)| n.load(Ordering::Acquire) > 0) && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }

        let abandoned: Vec<(Partition, usize)> = draining
            .iter()
            .filter_map(|(p, n)| {
                let pending = n.load(Ordering::Acquire);
                (pending > 0).then(|| (p.clone(), pending))
            })
            .collect();

        for (partition, pending) in &abandoned {
            warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                pending,
                "Revoked partition still has in-flight records; their results will not be committed"
            );
        }

        let revoked: Vec<Partition> = draining.into_iter().map(|(p, _)| p).collect();
        if !revoked.is_empty() {
            info!(count = revoked.len(), "Partitions revoked");
            self.metrics.record(ConsumerEvent::Rebalanced {
                assigned: 0,
                revoked: revoked.len(),
            });
        }

        RevocationReport { revoked, abandoned }
    }

    /// Partitions currently owned
    pub fn current_assignment(&self) -> BTreeSet<Partition> {
        self.state.lock().partitions.keys().cloned().collect()
    }

    /// Snapshot of one partition's state
    pub fn assignment(&self, partition: &Partition) -> Option<PartitionAssignment> {
        self.state
            .lock()
            .partitions
            .get(partition)
            .map(|s| s.assignment.clone())
    }

    /// Records currently leased on a partition
    pub fn in_flight(&self, partition: &Partition) -> usize {
        self.state
            .lock()
            .partitions
            .get(partition)
            .map(|s| s.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Whether the ownership behind `token` is still live
    pub fn is_owned(&self, token: &OwnershipToken) -> bool {
        self.state
            .lock()
            .partitions
            .get(&token.partition)
            .is_some_and(|s| s.assignment.generation == token.generation)
    }

    /// Token for the current ownership of a partition
    pub fn ownership(&self, partition: &Partition) -> Option<OwnershipToken> {
        self.state
            .lock()
            .partitions
            .get(partition)
            .map(|s| OwnershipToken {
                partition: partition.clone(),
                generation: s.assignment.generation,
            })
    }

    /// Lease a record under the current ownership; `None` when the partition is not owned
    pub fn lease(&self, partition: &Partition, offset: i64) -> Option<PartitionLease> {
        let token = self.ownership(partition)?;
        self.lease_with(&token, offset)
    }

    /// Lease a record dispatched under `token`; `None` once that ownership ended
    pub fn lease_with(&self, token: &OwnershipToken, offset: i64) -> Option<PartitionLease> {
        let mut state = self.state.lock();
        let entry = state
            .partitions
            .get_mut(&token.partition)
            .filter(|s| s.assignment.generation == token.generation)?;
        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        entry.assignment.next_expected = Some(offset + 1);

        Some(PartitionLease {
            token: token.clone(),
            offset,
            in_flight: entry.in_flight.clone(),
            revoked: entry.revoked.clone(),
        })
    }

    /// Commit `next_offset` if the ownership behind `token` is still live.
    /// A revoked partition yields `Dropped`; committed offsets never move
    /// backwards.
    pub fn commit_if_owned(
        &self,
        token: &OwnershipToken,
        next_offset: i64,
        committer: &dyn OffsetCommitter,
    ) -> ConsumerResult<CommitDecision> {
        let mut state = self.state.lock();
        let entry = match state.partitions.get_mut(&token.partition) {
            Some(entry) if entry.assignment.generation == token.generation => entry,
            _ => {
                debug!(
                    topic = token.partition.topic(),
                    partition = token.partition.partition(),
                    next_offset,
                    "Dropping commit for partition no longer owned"
                );
                return Ok(CommitDecision::Dropped);
            }
        };

        if matches!(entry.assignment.last_committed, Some(last) if next_offset <= last) {
            return Ok(CommitDecision::Skipped(SkipReason::AlreadyCommitted));
        }

        committer.commit(&token.partition, next_offset)?;
        entry.assignment.last_committed = Some(next_offset);
        Ok(CommitDecision::Committed { next_offset })
    }
}
