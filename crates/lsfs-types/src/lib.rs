#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical block number on the underlying device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Monotonic sequence number of a log segment.
///
/// Assigned when a hold begins; segment N's batch is always submitted to the
/// I/O layer before segment N+1's hold can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentSeq(pub u64);

/// Identifier of one submitted write batch.
///
/// Each batch is completed exactly once by the I/O layer; the id ties the
/// completion back to its submission for fault reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

/// Durability level requested for a segment-lock hold.
///
/// Flags accumulate across reentrant acquisitions: the outermost release
/// honors the union of everything requested during the hold. `CHECKPOINT`
/// implies the drain wait of `SYNC` plus a superblock write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteFlags {
    sync: bool,
    checkpoint: bool,
}

impl WriteFlags {
    /// No durability requirement: release submits the batch and returns.
    pub const NONE: Self = Self {
        sync: false,
        checkpoint: false,
    };

    /// Wait for all outstanding batches to complete before release returns.
    pub const SYNC: Self = Self {
        sync: true,
        checkpoint: false,
    };

    /// SYNC plus a superblock write marking the new recovery point.
    pub const CHECKPOINT: Self = Self {
        sync: true,
        checkpoint: true,
    };

    /// Union with another flag set. Flags only ever strengthen.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            sync: self.sync || other.sync,
            checkpoint: self.checkpoint || other.checkpoint,
        }
    }

    /// Whether the release must wait for the outstanding-I/O drain.
    #[must_use]
    pub fn wants_drain(self) -> bool {
        self.sync || self.checkpoint
    }

    /// Whether the release must write the superblock after the drain.
    #[must_use]
    pub fn wants_checkpoint(self) -> bool {
        self.checkpoint
    }
}

impl fmt::Display for WriteFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.sync, self.checkpoint) {
            (_, true) => write!(f, "checkpoint"),
            (true, false) => write!(f, "sync"),
            (false, false) => write!(f, "none"),
        }
    }
}
