#![forbid(unsafe_code)]
//! Segment lock and checkpoint accounting for the log-structured file system.
//!
//! One [`SegmentCoordinator`] per mount serializes segment construction:
//! acquire the lock, append block writes, release. Reentrant acquisitions by
//! the same logical writer deepen the hold (proved by the [`WriterToken`],
//! not by thread identity); the outermost release finalizes the segment,
//! submits it as one asynchronous batch, and, when SYNC or CHECKPOINT was
//! requested anywhere in the hold, waits for every outstanding batch to
//! drain before declaring durability.

pub mod coordinator;

pub use coordinator::{ReleaseOutcome, SegmentBuilder, SegmentCoordinator, WriterToken};
pub use lsfs_types::WriteFlags;
