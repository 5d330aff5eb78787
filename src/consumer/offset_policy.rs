//! Start offset resolution for newly assigned partitions

use crate::consumer::config::StartOffset;
use crate::consumer::record::Partition;
use rdkafka::Offset;

/// Where a freshly assigned partition should start reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeekAction {
    /// Continue from the committed position
    Resume {
        /// Committed offset, i.e. the next record to read
        offset: i64,
    },
    /// Seek to a broker reference point
    SeekTo(StartOffset),
    /// Issue no seek; the group's `auto.offset.reset` decides
    GroupDefault,
}

impl SeekAction {
    /// Whether a subscribed consumer must seek; resuming needs no seek
    /// since the client starts from the committed position anyway
    pub fn requires_seek(&self) -> bool {
        matches!(self, SeekAction::SeekTo(_))
    }

    /// Offset to hand to the client, `None` for the group default
    pub fn to_offset(&self) -> Option<Offset> {
        match self {
            SeekAction::Resume { offset } => Some(Offset::Offset(*offset)),
            SeekAction::SeekTo(StartOffset::Earliest) => Some(Offset::Beginning),
            SeekAction::SeekTo(StartOffset::Latest) => Some(Offset::End),
            SeekAction::GroupDefault => None,
        }
    }

    /// Offset for an initial `assign` call; the group default maps to the stored position
    pub fn to_assign_offset(&self) -> Offset {
        self.to_offset().unwrap_or(Offset::Stored)
    }
}

/// Pure function of binding policy and a committed-offset snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPolicyResolver {
    start_offset: Option<StartOffset>,
    reset_offsets: bool,
}

impl OffsetPolicyResolver {
    pub fn new(start_offset: Option<StartOffset>, reset_offsets: bool) -> Self {
        Self {
            start_offset,
            reset_offsets,
        }
    }

    /// Resolve the start position of a partition.
    ///
    /// A committed offset wins unless `resetOffsets` forces the configured
    /// reference point. Without a start offset no explicit seek is issued.
    pub fn resolve_start(&self, partition: &Partition, committed: Option<i64>) -> SeekAction {
        self.resolve(partition, committed, self.reset_offsets)
    }

    /// Resolution for a partition seen before in this process; resets apply
    /// only to the first assignment
    pub fn resolve_reassigned(&self, partition: &Partition, committed: Option<i64>) -> SeekAction {
        self.resolve(partition, committed, false)
    }

    fn resolve(&self, _partition: &Partition, committed: Option<i64>, reset: bool) -> SeekAction {
        match (committed, self.start_offset) {
            (Some(offset), _) if !reset || self.start_offset.is_none() => {
                SeekAction::Resume { offset }
            }
            (_, Some(start)) => SeekAction::SeekTo(start),
            (_, None) => SeekAction::GroupDefault,
        }
    }
}
