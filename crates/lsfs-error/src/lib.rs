#![forbid(unsafe_code)]
//! Error types for the LSFS segment writer.
//!
//! # Error Taxonomy
//!
//! Failures fall into three classes with distinct handling:
//!
//! | Class | Representation | Handling |
//! |-------|----------------|----------|
//! | Contract violation | `panic!` at the call site | A token from the wrong coordinator or a stale hold signals a bug in the calling code; process state is not trustworthy, so we halt with a diagnostic rather than continue |
//! | Batch I/O failure | [`LsfsError::BatchFailed`] | Recorded, the outstanding count is still decremented so no waiter hangs; surfaced both to the durability waiter and via the coordinator's fault register |
//! | Checkpoint failure | [`LsfsError::CheckpointFailed`] | The superblock write did not complete; the checkpoint MUST NOT be reported durable |
//!
//! `lsfs-error` is intentionally independent of `lsfs-types` and `lsfs-io` so
//! that every crate in the workspace can depend on it without cycles.

use thiserror::Error;

/// Unified error type for all segment-writer operations.
#[derive(Debug, Error)]
pub enum LsfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A submitted write batch reported failure on completion.
    ///
    /// The outstanding-I/O count was still decremented — waiters never hang
    /// on an errored batch — but any durability requested for the enclosing
    /// hold cannot be honored.
    #[error("write batch {batch} failed: {detail}")]
    BatchFailed { batch: u64, detail: String },

    /// The checkpoint's superblock write did not complete.
    ///
    /// Callers requesting a checkpoint receive this instead of a silent
    /// success; the previous recovery point remains in effect.
    #[error("checkpoint superblock write failed: {0}")]
    CheckpointFailed(String),
}

/// Result alias using `LsfsError`.
pub type Result<T> = std::result::Result<T, LsfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = LsfsError::BatchFailed {
            batch: 7,
            detail: "device offline".into(),
        };
        assert_eq!(err.to_string(), "write batch 7 failed: device offline");

        let ckp = LsfsError::CheckpointFailed("short write".into());
        assert_eq!(
            ckp.to_string(),
            "checkpoint superblock write failed: short write"
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::other("boom");
        let err: LsfsError = io.into();
        assert!(matches!(err, LsfsError::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}
