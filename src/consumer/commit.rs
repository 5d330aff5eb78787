//! Offset commit decisions and manual acknowledgment

use crate::consumer::assignment::{OwnershipToken, PartitionTracker};
use crate::consumer::config::BindingConfig;
use crate::consumer::error::ConsumerResult;
use crate::consumer::metrics::{ConsumerEvent, MetricsSink};
use crate::consumer::record::Partition;
use crate::consumer::retry::Outcome;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Durably records a consumer position with the group coordinator
pub trait OffsetCommitter: Send + Sync {
    /// Commit `next_offset`, the offset of the next record to consume
    fn commit(&self, partition: &Partition, next_offset: i64) -> ConsumerResult<()>;
}

/// Why no commit was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Record went to the DLQ with `autoCommitOnError: false`
    CommitOnErrorDisabled,
    /// Record ended fatal
    Fatal,
    /// Shutdown abandoned the record
    Abandoned,
    /// An equal or later offset is already committed
    AlreadyCommitted,
}

/// What the coordinator did for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    /// Offset committed
    Committed { next_offset: i64 },
    /// Policy says not to commit
    Skipped(SkipReason),
    /// Partition no longer owned; an expected race with rebalancing
    Dropped,
    /// Left to an explicit [`Acknowledgment`]
    Deferred,
}

/// Applies the binding's commit policy to record outcomes
pub struct CommitCoordinator {
    tracker: Arc<PartitionTracker>,
    committer: Arc<dyn OffsetCommitter>,
    auto_commit: bool,
    commit_on_dlq: bool,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("auto_commit", &self.auto_commit)
            .field("commit_on_dlq", &self.commit_on_dlq)
            .finish()
    }
}

impl CommitCoordinator {
    pub fn new(
        tracker: Arc<PartitionTracker>,
        committer: Arc<dyn OffsetCommitter>,
        auto_commit: bool,
        commit_on_dlq: bool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            tracker,
            committer,
            auto_commit,
            commit_on_dlq,
            metrics,
        }
    }

    /// Coordinator following a resolved binding's policy
    pub fn for_binding(
        config: &BindingConfig,
        tracker: Arc<PartitionTracker>,
        committer: Arc<dyn OffsetCommitter>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::new(
            tracker,
            committer,
            config.policy().auto_commit_offset,
            config.commit_on_dlq(),
            metrics,
        )
    }

    /// Whether handlers get an [`Acknowledgment`] instead of automatic commits
    pub fn is_manual(&self) -> bool {
        !self.auto_commit
    }

    /// Handle the final outcome of the record at `offset`
    pub fn on_outcome(
        &self,
        token: &OwnershipToken,
        offset: i64,
        outcome: &Outcome,
    ) -> ConsumerResult<CommitDecision> {
        if !self.auto_commit {
            trace!(offset, "Commit deferred to acknowledgment");
            return Ok(CommitDecision::Deferred);
        }

        let skip = match outcome {
            Outcome::Success { .. } => None,
            Outcome::RoutedToDlq { .. } if self.commit_on_dlq => None,
            Outcome::RoutedToDlq { .. } => Some(SkipReason::CommitOnErrorDisabled),
            Outcome::Fatal { .. } => Some(SkipReason::Fatal),
            Outcome::Abandoned { .. } => Some(SkipReason::Abandoned),
        };

        match skip {
            Some(reason) => {
                debug!(
                    topic = token.partition().topic(),
                    partition = token.partition().partition(),
                    offset,
                    reason = ?reason,
                    "Commit skipped"
                );
                self.metrics.record(ConsumerEvent::CommitSkipped {
                    partition: token.partition().clone(),
                    offset,
                });
                Ok(CommitDecision::Skipped(reason))
            }
            None => commit(&self.tracker, self.committer.as_ref(), self.metrics.as_ref(), token, offset),
        }
    }

    /// Acknowledgment handle for a record, only in manual mode
    pub fn acknowledgment(&self, token: &OwnershipToken, offset: i64) -> Option<Acknowledgment> {
        self.is_manual().then(|| Acknowledgment {
            token: token.clone(),
            offset,
            tracker: self.tracker.clone(),
            committer: self.committer.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

fn commit(
    tracker: &PartitionTracker,
    committer: &dyn OffsetCommitter,
    metrics: &dyn MetricsSink,
    token: &OwnershipToken,
    offset: i64,
) -> ConsumerResult<CommitDecision> {
    let decision = tracker.commit_if_owned(token, offset + 1, committer)?;
    let partition = token.partition().clone();
    match decision {
        CommitDecision::Committed { next_offset } => metrics.record(ConsumerEvent::Committed {
            partition,
            next_offset,
        }),
        CommitDecision::Dropped => metrics.record(ConsumerEvent::CommitDropped { partition, offset }),
        CommitDecision::Skipped(_) => metrics.record(ConsumerEvent::CommitSkipped { partition, offset }),
        CommitDecision::Deferred => {}
    }
    Ok(decision)
}

/// Commits one record's offset on request, subject to the same ownership
/// check as automatic commits. Acknowledging twice is harmless.
#[derive(Clone)]
pub struct Acknowledgment {
    token: OwnershipToken,
    offset: i64,
    tracker: Arc<PartitionTracker>,
    committer: Arc<dyn OffsetCommitter>,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgment")
            .field("partition", self.token.partition())
            .field("offset", &self.offset)
            .finish()
    }
}

impl Acknowledgment {
    /// Offset of the acknowledged record
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Commit `offset + 1`
    pub fn acknowledge(&self) -> ConsumerResult<CommitDecision> {
        commit(
            &self.tracker,
            self.committer.as_ref(),
            self.metrics.as_ref(),
            &self.token,
            self.offset,
        )
    }
}
