//! The segment lock state machine and checkpoint I/O accounting.
//!
//! Protocol:
//! - [`SegmentCoordinator::acquire`] grants exclusive ownership of segment
//!   construction and returns a [`WriterToken`]. Nested operations by the
//!   same logical writer deepen the hold with
//!   [`reacquire`](SegmentCoordinator::reacquire), passing the token to prove
//!   legitimate reentrancy; no thread-identity comparison is involved.
//! - Block writes accumulate in a [`SegmentBuilder`] owned by the hold.
//! - The outermost [`release`](SegmentCoordinator::release) finalizes the
//!   segment (summary block last), registers the batch with the
//!   outstanding-I/O accounting, submits it, and wakes one blocked acquirer.
//!   If SYNC or CHECKPOINT was requested anywhere in the hold, the releasing
//!   thread then waits for the outstanding count to drain; CHECKPOINT
//!   additionally writes the superblock once the drain completes.
//! - Completions arrive from the I/O layer on arbitrary threads through the
//!   [`BatchCompletion`] handle; this is the only cross-thread concurrency in
//!   the design, everything else is serialized by the lock itself.
//!
//! Misuse of the token contract (wrong coordinator, stale hold, release while
//! unlocked) panics with a diagnostic: those are bugs in the calling code,
//! not runtime conditions to recover from.

use lsfs_error::{LsfsError, Result};
use lsfs_io::{BatchCompletion, BatchStatus, BlockWriteRequest, SegmentIo, SuperblockImage, WriteBatch};
use lsfs_types::{BatchId, BlockNumber, SegmentSeq, WriteFlags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

// ---------------------------------------------------------------------------
// Segment builder
// ---------------------------------------------------------------------------

/// The in-progress segment: an ordered write set plus the summary built at
/// finalization.
///
/// Exclusively owned by the current lock holder; created on the outermost
/// acquire and consumed by the outermost release.
#[derive(Debug)]
pub struct SegmentBuilder {
    seq: SegmentSeq,
    writes: Vec<BlockWriteRequest>,
    payload_bytes: usize,
}

impl SegmentBuilder {
    /// Start an empty segment with the given sequence number.
    #[must_use]
    pub fn new(seq: SegmentSeq) -> Self {
        Self {
            seq,
            writes: Vec::new(),
            payload_bytes: 0,
        }
    }

    /// Sequence number of this segment.
    #[must_use]
    pub fn seq(&self) -> SegmentSeq {
        self.seq
    }

    /// Append one block write, preserving order.
    pub fn push(&mut self, block: BlockNumber, data: Vec<u8>) {
        self.payload_bytes = self.payload_bytes.saturating_add(data.len());
        self.writes.push(BlockWriteRequest { block, data });
    }

    /// Number of block writes accumulated so far (summary not included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether no block writes have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Total payload bytes accumulated so far.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Finalize the segment: append the summary block last and return the
    /// complete write set.
    ///
    /// Returns `None` for an empty segment; a hold that never added a block
    /// writes nothing at all.
    #[must_use]
    pub fn finalize(self) -> Option<Vec<BlockWriteRequest>> {
        if self.writes.is_empty() {
            return None;
        }

        let summary = Self::summary_payload(self.seq, &self.writes);
        // In-memory convention: the summary occupies the log position after
        // the last data block. Physical placement is the backend's concern.
        let last = self
            .writes
            .last()
            .map_or(BlockNumber(0), |w| BlockNumber(w.block.0.saturating_add(1)));

        let mut writes = self.writes;
        writes.push(BlockWriteRequest {
            block: last,
            data: summary,
        });
        Some(writes)
    }

    /// Summary encoding: seq, write count, then (block, length) per write,
    /// with a trailing CRC32C over everything preceding it.
    fn summary_payload(seq: SegmentSeq, writes: &[BlockWriteRequest]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + writes.len() * 12);
        buf.extend_from_slice(&seq.0.to_le_bytes());
        let count = u32::try_from(writes.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_le_bytes());
        for w in writes {
            buf.extend_from_slice(&w.block.0.to_le_bytes());
            let len = u32::try_from(w.data.len()).unwrap_or(u32::MAX);
            buf.extend_from_slice(&len.to_le_bytes());
        }
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

// ---------------------------------------------------------------------------
// Writer token
// ---------------------------------------------------------------------------

/// Proof of a live segment-lock hold.
///
/// Returned by [`SegmentCoordinator::acquire`] and
/// [`SegmentCoordinator::reacquire`], consumed by
/// [`release`](SegmentCoordinator::release) or
/// [`abandon`](SegmentCoordinator::abandon). Tokens are not clonable, so a
/// hold cannot be released twice; validation against the coordinator id and
/// hold generation catches tokens smuggled across coordinators.
#[derive(Debug)]
#[must_use = "a writer token must be passed back to release() or abandon()"]
pub struct WriterToken {
    coordinator: u64,
    hold: u64,
}

// ---------------------------------------------------------------------------
// Lock and I/O accounting state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LockState {
    /// 0 means unlocked; >0 is the reentrancy depth of the current hold.
    depth: u32,
    /// Hold generation; bumped on each outermost acquire and stamped into
    /// tokens for validation.
    hold: u64,
    /// Union of all flags requested during the current hold.
    flags: WriteFlags,
    /// Present iff `depth > 0`.
    segment: Option<SegmentBuilder>,
    /// Set by `abandon()`; forces a discard at the outermost exit.
    abandoned: bool,
    /// Live acquisitions, gating unmount.
    active_writers: u64,
}

#[derive(Debug)]
struct IoState {
    /// Batches submitted but not yet completed.
    outstanding: u64,
    /// First recorded batch failure; sticky until `clear_fault()`.
    failed: Option<(BatchId, String)>,
}

/// Outstanding-I/O accounting shared with in-flight completion handles.
#[derive(Debug)]
struct IoStatus {
    state: Mutex<IoState>,
    drained: Condvar,
}

impl IoStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(IoState {
                outstanding: 0,
                failed: None,
            }),
            drained: Condvar::new(),
        })
    }

    /// Account for one submitted batch and hand back its completion handle.
    ///
    /// The increment happens here, before the caller clears the segment lock,
    /// so a durability waiter can never observe a spurious zero between
    /// submission and accounting.
    fn register(self: &Arc<Self>, batch: BatchId) -> BatchCompletion {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.outstanding = state.outstanding.saturating_add(1);
        }
        let status = Arc::clone(self);
        BatchCompletion::new(batch, move |id, st| status.complete(id, st))
    }

    /// Completion side; may run on any thread.
    fn complete(&self, batch: BatchId, status: BatchStatus) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.outstanding = state.outstanding.saturating_sub(1);
        match status {
            BatchStatus::Done => {
                tracing::trace!(
                    target: "lsfs::segment",
                    batch = batch.0,
                    outstanding = state.outstanding,
                    "batch_complete"
                );
            }
            BatchStatus::Failed(detail) => {
                tracing::error!(
                    target: "lsfs::segment",
                    batch = batch.0,
                    detail = %detail,
                    outstanding = state.outstanding,
                    "batch_failed"
                );
                // Keep the first failure; the count is still decremented so
                // waiters are never blocked forever on an errored batch.
                if state.failed.is_none() {
                    state.failed = Some((batch, detail));
                }
            }
        }
        let drained = state.outstanding == 0;
        drop(state);
        if drained {
            self.drained.notify_all();
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// What an exit from the lock produced, before any durability wait.
#[derive(Debug)]
enum HoldExit {
    /// Inner release of a reentrant hold; no I/O, no wakeup.
    Nested,
    /// The outermost exit; the lock is now free.
    Outermost {
        submitted: Option<(BatchId, usize)>,
        seq: SegmentSeq,
        flags: WriteFlags,
        abandoned: bool,
    },
}

/// Result of releasing a segment-lock hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Inner release of a reentrant hold.
    Nested,
    /// The segment was discarded without writing (empty or abandoned hold).
    Discarded,
    /// The segment's batch was submitted; durability was not requested, or
    /// SYNC was requested and the drain completed.
    Submitted { batch: BatchId, writes: usize },
    /// Full checkpoint: drain completed and the superblock is written.
    /// `batch` is `None` when the checkpointing hold itself wrote no blocks.
    Checkpointed { batch: Option<BatchId>, writes: usize },
}

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes segment construction for one mounted filesystem and accounts
/// for in-flight segment batches until checkpoints can be declared durable.
pub struct SegmentCoordinator {
    id: u64,
    io: Arc<dyn SegmentIo>,
    lock: Mutex<LockState>,
    /// Wakes blocked acquirers; exactly one per lock cycle (`notify_one`),
    /// so queued writers compete again instead of stampeding.
    lock_free: Condvar,
    /// Wakes `quiesce()` waiters whenever the lock becomes free.
    idle: Condvar,
    status: Arc<IoStatus>,
    next_seq: AtomicU64,
    next_batch: AtomicU64,
}

impl std::fmt::Debug for SegmentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCoordinator")
            .field("id", &self.id)
            .field("lock", &self.lock)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl SegmentCoordinator {
    /// Create a coordinator writing through the given I/O backend.
    ///
    /// One instance per mount; independent mounts get independent
    /// coordinators and cannot interfere.
    #[must_use]
    pub fn new(io: Arc<dyn SegmentIo>) -> Self {
        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            io,
            lock: Mutex::new(LockState {
                depth: 0,
                hold: 0,
                flags: WriteFlags::NONE,
                segment: None,
                abandoned: false,
                active_writers: 0,
            }),
            lock_free: Condvar::new(),
            idle: Condvar::new(),
            status: IoStatus::new(),
            next_seq: AtomicU64::new(0),
            next_batch: AtomicU64::new(0),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(&self, state: &LockState, token: &WriterToken) {
        assert!(
            token.coordinator == self.id,
            "writer token belongs to a different coordinator (contract violation)"
        );
        assert!(
            state.depth > 0,
            "segment lock used while unlocked (contract violation)"
        );
        assert!(
            token.hold == state.hold,
            "writer token is stale: token hold {} vs current hold {} (contract violation)",
            token.hold,
            state.hold
        );
    }

    /// Acquire exclusive ownership of segment construction.
    ///
    /// Blocks (condvar wait, not a spin) while another hold is live. On
    /// entry a fresh segment is allocated and `flags` records the hold's
    /// initial durability requirement.
    pub fn acquire(&self, flags: WriteFlags) -> WriterToken {
        let mut state = self.lock_state();
        while state.depth > 0 {
            state = self
                .lock_free
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let seq = SegmentSeq(self.next_seq.fetch_add(1, Ordering::AcqRel).saturating_add(1));
        state.depth = 1;
        state.hold = state.hold.saturating_add(1);
        state.flags = flags;
        state.segment = Some(SegmentBuilder::new(seq));
        state.abandoned = false;
        state.active_writers = state.active_writers.saturating_add(1);

        tracing::debug!(
            target: "lsfs::segment",
            seq = seq.0,
            hold = state.hold,
            flags = %flags,
            "seglock_acquire"
        );

        WriterToken {
            coordinator: self.id,
            hold: state.hold,
        }
    }

    /// Reentrant acquisition by the writer already holding the lock.
    ///
    /// Never blocks and performs no I/O; the hold deepens and `flags` merges
    /// into the hold's accumulated requirement. The returned token belongs to
    /// the same hold and must also be released.
    ///
    /// # Panics
    ///
    /// Panics if `token` does not prove the current hold.
    pub fn reacquire(&self, token: &WriterToken, flags: WriteFlags) -> WriterToken {
        let mut state = self.lock_state();
        self.validate(&state, token);

        state.depth = state.depth.saturating_add(1);
        state.flags = state.flags.merge(flags);
        state.active_writers = state.active_writers.saturating_add(1);

        tracing::trace!(
            target: "lsfs::segment",
            depth = state.depth,
            flags = %state.flags,
            "seglock_reacquire"
        );

        WriterToken {
            coordinator: self.id,
            hold: state.hold,
        }
    }

    /// Append one block write to the active segment.
    ///
    /// # Panics
    ///
    /// Panics if `token` does not prove the current hold.
    pub fn add_write(&self, token: &WriterToken, block: BlockNumber, data: Vec<u8>) {
        let mut state = self.lock_state();
        self.validate(&state, token);

        let segment = state
            .segment
            .as_mut()
            .expect("segment exists while the lock is held");
        segment.push(block, data);

        tracing::trace!(
            target: "lsfs::segment",
            seq = segment.seq().0,
            block = block.0,
            pending = segment.len(),
            "segment_add_write"
        );
    }

    /// Number of block writes buffered in the active segment.
    ///
    /// # Panics
    ///
    /// Panics if `token` does not prove the current hold.
    #[must_use]
    pub fn pending_writes(&self, token: &WriterToken) -> usize {
        let state = self.lock_state();
        self.validate(&state, token);
        state
            .segment
            .as_ref()
            .expect("segment exists while the lock is held")
            .len()
    }

    /// Release one level of the hold.
    ///
    /// Inner releases just decrement the depth. The outermost release
    /// finalizes and submits the segment, frees the lock, wakes one blocked
    /// acquirer, then honors the hold's accumulated durability requirement:
    /// SYNC waits for the outstanding-I/O drain, CHECKPOINT additionally
    /// writes the superblock. A drain that observed a batch failure returns
    /// [`LsfsError::BatchFailed`]; a failed superblock write returns
    /// [`LsfsError::CheckpointFailed`] and the checkpoint is not durable.
    ///
    /// # Panics
    ///
    /// Panics if `token` does not prove the current hold.
    pub fn release(&self, token: WriterToken) -> Result<ReleaseOutcome> {
        match self.exit_hold(token, false) {
            HoldExit::Nested => Ok(ReleaseOutcome::Nested),
            HoldExit::Outermost {
                abandoned: true, ..
            } => Ok(ReleaseOutcome::Discarded),
            HoldExit::Outermost {
                submitted,
                seq,
                flags,
                abandoned: false,
            } => {
                if flags.wants_drain() {
                    self.wait_drained()?;
                    if flags.wants_checkpoint() {
                        self.write_checkpoint(seq)?;
                        return Ok(ReleaseOutcome::Checkpointed {
                            batch: submitted.map(|(batch, _)| batch),
                            writes: submitted.map_or(0, |(_, writes)| writes),
                        });
                    }
                }
                Ok(submitted.map_or(ReleaseOutcome::Discarded, |(batch, writes)| {
                    ReleaseOutcome::Submitted { batch, writes }
                }))
            }
        }
    }

    /// Abandon the hold without writing.
    ///
    /// First-class alternative to [`release`](Self::release) for a segment
    /// that was started but must not reach disk (for example, the operation
    /// building it failed partway). Inner abandons behave like inner
    /// releases but poison the hold: whichever call exits the outermost
    /// level discards the segment, drops the accumulated flags, and performs
    /// no I/O and no durability wait.
    ///
    /// # Panics
    ///
    /// Panics if `token` does not prove the current hold.
    pub fn abandon(&self, token: WriterToken) -> ReleaseOutcome {
        match self.exit_hold(token, true) {
            HoldExit::Nested => ReleaseOutcome::Nested,
            HoldExit::Outermost { .. } => ReleaseOutcome::Discarded,
        }
    }

    fn exit_hold(&self, token: WriterToken, abandon: bool) -> HoldExit {
        let mut state = self.lock_state();
        self.validate(&state, &token);

        if abandon {
            state.abandoned = true;
        }
        state.active_writers = state.active_writers.saturating_sub(1);

        if state.depth > 1 {
            state.depth -= 1;
            tracing::trace!(
                target: "lsfs::segment",
                depth = state.depth,
                abandoned = state.abandoned,
                "seglock_release_nested"
            );
            return HoldExit::Nested;
        }

        // Outermost exit.
        let flags = std::mem::take(&mut state.flags);
        let abandoned = state.abandoned;
        let builder = state
            .segment
            .take()
            .expect("segment exists while the lock is held");
        let seq = builder.seq();
        let blocks = builder.len();

        let mut submitted = None;
        if !abandoned {
            if let Some(writes) = builder.finalize() {
                let batch = WriteBatch {
                    id: BatchId(
                        self.next_batch
                            .fetch_add(1, Ordering::AcqRel)
                            .saturating_add(1),
                    ),
                    seq,
                    writes,
                };
                let id = batch.id;
                let len = batch.len();
                let done = self.status.register(id);
                // Submission happens before the lock is cleared so segment
                // N's batch reaches the I/O layer before segment N+1's hold
                // can begin.
                self.io.submit_batch(batch, done);
                submitted = Some((id, len));

                tracing::info!(
                    target: "lsfs::segment",
                    seq = seq.0,
                    batch = id.0,
                    writes = len,
                    flags = %flags,
                    "segment_submitted"
                );
            } else {
                tracing::debug!(
                    target: "lsfs::segment",
                    seq = seq.0,
                    "segment_empty_discard"
                );
            }
        } else {
            tracing::debug!(
                target: "lsfs::segment",
                seq = seq.0,
                blocks,
                "segment_abandoned"
            );
        }

        state.depth = 0;
        state.abandoned = false;
        drop(state);

        // Exactly one blocked acquirer is woken per lock cycle; the rest
        // compete again when it releases in turn.
        self.lock_free.notify_one();
        self.idle.notify_all();

        HoldExit::Outermost {
            submitted,
            seq,
            flags,
            abandoned,
        }
    }

    /// Wait for the outstanding-I/O count to drain to zero.
    ///
    /// Completions always decrement the count, failures included, so this
    /// never hangs on an errored batch; the error surfaces afterwards.
    fn wait_drained(&self) -> Result<()> {
        let mut state = self
            .status
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while state.outstanding > 0 {
            state = self
                .status
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if let Some((batch, detail)) = state.failed.clone() {
            return Err(LsfsError::BatchFailed {
                batch: batch.0,
                detail,
            });
        }
        Ok(())
    }

    fn write_checkpoint(&self, seq: SegmentSeq) -> Result<()> {
        let image = SuperblockImage { checkpoint: seq };
        match self.io.write_superblock(&image) {
            Ok(()) => {
                tracing::info!(
                    target: "lsfs::segment",
                    checkpoint = seq.0,
                    "checkpoint_durable"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    target: "lsfs::segment",
                    checkpoint = seq.0,
                    error = %err,
                    "checkpoint_superblock_failed"
                );
                Err(LsfsError::CheckpointFailed(err.to_string()))
            }
        }
    }

    /// The first recorded batch failure, if any.
    ///
    /// The fault is sticky: durability waits keep failing until a recovery
    /// layer acknowledges it via [`clear_fault`](Self::clear_fault).
    #[must_use]
    pub fn fault(&self) -> Option<(BatchId, String)> {
        self.status
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failed
            .clone()
    }

    /// Acknowledge and clear the recorded batch failure.
    pub fn clear_fault(&self) {
        self.status
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failed = None;
    }

    /// Batches submitted but not yet completed.
    #[must_use]
    pub fn outstanding_batches(&self) -> u64 {
        self.status
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outstanding
    }

    /// Whether a hold is currently live.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_state().depth > 0
    }

    /// Count of live acquisitions (equals the reentrancy depth of the
    /// current hold). The unmount path uses this together with
    /// [`quiesce`](Self::quiesce) to refuse teardown while a writer is
    /// active.
    #[must_use]
    pub fn active_writers(&self) -> u64 {
        self.lock_state().active_writers
    }

    /// Block until the lock is free and all submitted batches have
    /// completed. The unmount gate; the caller must ensure no new writers
    /// start while quiescing.
    pub fn quiesce(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            while state.depth > 0 {
                state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.wait_drained()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
