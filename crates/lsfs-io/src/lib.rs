#![forbid(unsafe_code)]
//! Block-I/O boundary for the segment writer.
//!
//! Defines the [`SegmentIo`] trait that the coordinator submits finalized
//! segments through, plus the [`BatchCompletion`] handle carrying the
//! exactly-once completion contract back from the I/O layer.
//!
//! # Design
//!
//! Submission is fire-and-forget: `submit_batch` returns immediately and the
//! backend invokes the completion handle when the writes have reached (or
//! failed to reach) stable storage, possibly from another thread. The
//! superblock write is deliberately synchronous — it is only issued at
//! checkpoint boundaries, after all outstanding batches have drained, and the
//! caller is already committed to waiting.
//!
//! Two in-memory backends are provided for tests and benchmarks:
//!
//! - [`MemSegmentIo`]: completes every batch inline, with injectable
//!   batch/superblock failures.
//! - [`ManualSegmentIo`]: parks submissions until the test explicitly
//!   completes them, for exercising drain waits and completion races.

use lsfs_error::{LsfsError, Result};
use lsfs_types::{BatchId, BlockNumber, SegmentSeq};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One block write within a segment.
///
/// The payload is opaque to this layer; encoding of inodes, directory data,
/// and summary blocks belongs to the callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWriteRequest {
    /// Destination block on the device.
    pub block: BlockNumber,
    /// Block payload.
    pub data: Vec<u8>,
}

/// A finalized segment's write set, submitted as one asynchronous unit.
///
/// Writes are applied in order; the segment summary is always the last
/// element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    /// Identifier tying the eventual completion back to this submission.
    pub id: BatchId,
    /// Sequence number of the segment this batch persists.
    pub seq: SegmentSeq,
    /// Ordered block writes, summary last.
    pub writes: Vec<BlockWriteRequest>,
}

impl WriteBatch {
    /// Number of block writes in the batch (including the summary).
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the batch carries no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Total payload bytes across all writes.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.writes.iter().map(|w| w.data.len()).sum()
    }
}

/// Superblock content written at a checkpoint boundary.
///
/// Only the recovery-point sequence is meaningful to the coordinator; the
/// full on-disk superblock encoding is owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockImage {
    /// The segment sequence the new recovery point covers.
    pub checkpoint: SegmentSeq,
}

/// Terminal status of one submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStatus {
    /// All writes in the batch reached stable storage.
    Done,
    /// The batch failed; the detail is surfaced to durability waiters.
    Failed(String),
}

type CompletionFn = Box<dyn FnOnce(BatchId, BatchStatus) + Send>;

/// Exactly-once completion handle for a submitted batch.
///
/// The backend MUST resolve every handle it receives. Invoking
/// [`complete`](Self::complete) consumes the handle; if a backend drops it
/// unresolved (a bug, or a panic unwinding through the I/O path), the drop
/// counts as a failure completion so that no durability waiter hangs.
pub struct BatchCompletion {
    batch: BatchId,
    notify: Option<CompletionFn>,
}

impl std::fmt::Debug for BatchCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCompletion")
            .field("batch", &self.batch)
            .field("resolved", &self.notify.is_none())
            .finish()
    }
}

impl BatchCompletion {
    /// Create a handle for `batch` that reports its status through `notify`.
    #[must_use]
    pub fn new(batch: BatchId, notify: impl FnOnce(BatchId, BatchStatus) + Send + 'static) -> Self {
        Self {
            batch,
            notify: Some(Box::new(notify)),
        }
    }

    /// The batch this handle belongs to.
    #[must_use]
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    /// Resolve the batch with `status`, consuming the handle.
    pub fn complete(mut self, status: BatchStatus) {
        if let Some(notify) = self.notify.take() {
            notify(self.batch, status);
        }
    }
}

impl Drop for BatchCompletion {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            tracing::warn!(
                target: "lsfs::io",
                batch = self.batch.0,
                "batch_completion_dropped_unresolved"
            );
            notify(
                self.batch,
                BatchStatus::Failed("completion handle dropped without resolution".to_owned()),
            );
        }
    }
}

/// Block-I/O service the segment coordinator writes through.
pub trait SegmentIo: Send + Sync {
    /// Submit one segment's write batch asynchronously.
    ///
    /// Returns immediately. The backend resolves `done` exactly once when the
    /// batch has succeeded or failed, possibly from another thread.
    fn submit_batch(&self, batch: WriteBatch, done: BatchCompletion);

    /// Write the superblock synchronously, marking a new recovery point.
    ///
    /// Only called at checkpoint boundaries after all prior batches have
    /// completed.
    fn write_superblock(&self, image: &SuperblockImage) -> Result<()>;
}

/// Submission statistics common to the in-memory backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Batches submitted.
    pub batches: u64,
    /// Block writes across all batches (summaries included).
    pub writes: u64,
    /// Payload bytes across all batches.
    pub bytes_written: u64,
    /// Superblock writes issued.
    pub superblocks: u64,
}

#[derive(Debug, Default)]
struct Recorded {
    batches: Vec<WriteBatch>,
    superblocks: Vec<SuperblockImage>,
    stats: IoStats,
}

impl Recorded {
    fn record_batch(&mut self, batch: &WriteBatch) {
        self.stats.batches += 1;
        self.stats.writes += batch.len() as u64;
        self.stats.bytes_written += batch.payload_bytes() as u64;
        self.batches.push(batch.clone());
    }
}

/// In-memory backend that completes every batch inline.
///
/// Failures are injectable: `fail_next_batch` makes the next submission
/// complete with [`BatchStatus::Failed`], `fail_superblock` makes superblock
/// writes return an error until cleared.
#[derive(Debug, Default)]
pub struct MemSegmentIo {
    recorded: Mutex<Recorded>,
    fail_next_batch: AtomicBool,
    fail_superblock: AtomicBool,
}

impl MemSegmentIo {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next submitted batch complete with a failure.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::Release);
    }

    /// Make superblock writes fail until cleared.
    pub fn set_fail_superblock(&self, fail: bool) {
        self.fail_superblock.store(fail, Ordering::Release);
    }

    /// All batches submitted so far, in submission order.
    #[must_use]
    pub fn batches(&self) -> Vec<WriteBatch> {
        self.recorded.lock().batches.clone()
    }

    /// All superblock images written so far.
    #[must_use]
    pub fn superblocks(&self) -> Vec<SuperblockImage> {
        self.recorded.lock().superblocks.clone()
    }

    /// Current submission statistics.
    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.recorded.lock().stats.clone()
    }
}

impl SegmentIo for MemSegmentIo {
    fn submit_batch(&self, batch: WriteBatch, done: BatchCompletion) {
        self.recorded.lock().record_batch(&batch);

        let status = if self.fail_next_batch.swap(false, Ordering::AcqRel) {
            BatchStatus::Failed("injected batch failure".to_owned())
        } else {
            BatchStatus::Done
        };

        tracing::debug!(
            target: "lsfs::io",
            batch = batch.id.0,
            seq = batch.seq.0,
            writes = batch.len(),
            failed = matches!(status, BatchStatus::Failed(_)),
            "mem_io_submit"
        );

        done.complete(status);
    }

    fn write_superblock(&self, image: &SuperblockImage) -> Result<()> {
        if self.fail_superblock.load(Ordering::Acquire) {
            return Err(LsfsError::Io(std::io::Error::other(
                "injected superblock failure",
            )));
        }
        let mut recorded = self.recorded.lock();
        recorded.stats.superblocks += 1;
        recorded.superblocks.push(*image);
        drop(recorded);

        tracing::debug!(
            target: "lsfs::io",
            checkpoint = image.checkpoint.0,
            "mem_io_superblock"
        );
        Ok(())
    }
}

/// In-memory backend that parks submissions until told to complete them.
///
/// Used to exercise the coordinator's drain waits: a test submits through the
/// coordinator on one thread and resolves completions from another via
/// [`complete_next`](Self::complete_next).
#[derive(Debug, Default)]
pub struct ManualSegmentIo {
    recorded: Mutex<Recorded>,
    pending: Mutex<VecDeque<BatchCompletion>>,
    fail_superblock: AtomicBool,
}

impl ManualSegmentIo {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of submitted batches not yet completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve the oldest pending batch with `status`.
    ///
    /// Returns the batch id, or `None` if nothing is pending.
    pub fn complete_next(&self, status: BatchStatus) -> Option<BatchId> {
        let done = self.pending.lock().pop_front()?;
        let id = done.batch();
        done.complete(status);
        Some(id)
    }

    /// Resolve every pending batch successfully.
    pub fn complete_all(&self) {
        while self.complete_next(BatchStatus::Done).is_some() {}
    }

    /// Make superblock writes fail until cleared.
    pub fn set_fail_superblock(&self, fail: bool) {
        self.fail_superblock.store(fail, Ordering::Release);
    }

    /// All batches submitted so far, in submission order.
    #[must_use]
    pub fn batches(&self) -> Vec<WriteBatch> {
        self.recorded.lock().batches.clone()
    }

    /// All superblock images written so far.
    #[must_use]
    pub fn superblocks(&self) -> Vec<SuperblockImage> {
        self.recorded.lock().superblocks.clone()
    }

    /// Current submission statistics.
    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.recorded.lock().stats.clone()
    }
}

impl SegmentIo for ManualSegmentIo {
    fn submit_batch(&self, batch: WriteBatch, done: BatchCompletion) {
        self.recorded.lock().record_batch(&batch);
        tracing::debug!(
            target: "lsfs::io",
            batch = batch.id.0,
            seq = batch.seq.0,
            writes = batch.len(),
            "manual_io_parked"
        );
        self.pending.lock().push_back(done);
    }

    fn write_superblock(&self, image: &SuperblockImage) -> Result<()> {
        if self.fail_superblock.load(Ordering::Acquire) {
            return Err(LsfsError::Io(std::io::Error::other(
                "injected superblock failure",
            )));
        }
        let mut recorded = self.recorded.lock();
        recorded.stats.superblocks += 1;
        recorded.superblocks.push(*image);
        Ok(())
    }
}
