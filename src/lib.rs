//! # Merged, deduplicated and windowed alignment streams
//!
//! This library turns several coordinate-sorted streams of alignment records
//! into one globally ordered stream and serves overlap queries from a bounded
//! sliding window over it.
//!
//! ## Pipeline
//!
//! 1. **Source runners**: each partition of the inputs is read on its own
//!    thread and published in packets through a bounded queue
//! 2. **Merge coordinator**: k-way merge over the runner heads ordered by
//!    (sequence, start, runner id)
//! 3. **Deduplicator**: collapses mated records observed twice
//! 4. **Window cache**: circular buffer answering "which records overlap
//!    `[start, end)`" and evicting whatever the caller has flushed
//!
//! ## Usage Example
//!
//! ```ignore
//! use rosalind_stream::{Deduplicator, MergeConfig, MergeCoordinator, WindowCache, WindowConfig};
//!
//! let merge = MergeCoordinator::new(sources, populator, MergeConfig::default())?;
//! let mut window = WindowCache::new(Deduplicator::new(merge), 0, WindowConfig::default())?;
//! let hits = window.records_overlap(1_000, 1_100)?;
//! window.flush(0, 1_000)?;
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::new_without_default)]

pub mod record;  // Record, locus ordering, regions
pub mod source;  // Source, populator and filter interfaces plus concrete readers
pub mod queue;   // Bounded hand-off queue and cancellation
pub mod merge;   // Source runners and the k-way merge coordinator
pub mod dedup;   // Mate-pair duplicate removal
pub mod window;  // Sliding-window record cache and flush tracking

// Re-exports for convenience
pub use record::{GenomeRegion, Locus, MateInfo, Record, RecordKind};
pub use source::{
    InvalidRecord, Populator, RecordCounts, RecordFilter, RecordSource, RecordStream,
    SequenceDictionary,
};
pub use queue::{BoundedRecordQueue, CancellationToken};
pub use merge::{MergeConfig, MergeCoordinator, SourceRunner};
pub use dedup::{DefaultResolver, Deduplicator, DuplicateResolver, Retain};
pub use window::{FlushTracker, SyncWindowCache, WindowCache, WindowConfig, WindowStats};

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Structural errors that terminate a merge or window session.
///
/// Per-record problems never surface here; they are absorbed by the source
/// runners as [`InvalidRecord`] counts.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Configuration invalid (e.g., zero packet size).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A record arrived out of coordinate order.
    #[error("record stream not sorted: {current} observed after {previous}")]
    NotSorted {
        /// Locus of the record seen first.
        previous: Locus,
        /// Locus of the offending record.
        current: Locus,
    },

    /// Per-source metadata could not be reconciled.
    #[error("incompatible sources: {0}")]
    IncompatibleSources(String),

    /// Caller invoked an operation outside its permitted range.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Cooperative cancellation observed while waiting.
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// Why the pipeline was cancelled.
        reason: String,
    },

    /// Underlying record source failed.
    #[error("source error: {0}")]
    Source(String),

    /// A source runner thread panicked.
    #[error("source runner {runner} panicked: {message}")]
    RunnerPanicked {
        /// Identifier of the runner.
        runner: usize,
        /// Panic payload rendered as text.
        message: String,
    },

    /// I/O failure while opening or reading an input.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Clone for StreamError {
    /// I/O errors are rebuilt from their kind and message.
    fn clone(&self) -> Self {
        match self {
            StreamError::InvalidConfiguration(msg) => StreamError::InvalidConfiguration(msg.clone()),
            StreamError::NotSorted { previous, current } => StreamError::NotSorted {
                previous: *previous,
                current: *current,
            },
            StreamError::IncompatibleSources(msg) => StreamError::IncompatibleSources(msg.clone()),
            StreamError::ContractViolation(msg) => StreamError::ContractViolation(msg.clone()),
            StreamError::Cancelled { reason } => StreamError::Cancelled {
                reason: reason.clone(),
            },
            StreamError::Source(msg) => StreamError::Source(msg.clone()),
            StreamError::RunnerPanicked { runner, message } => StreamError::RunnerPanicked {
                runner: *runner,
                message: message.clone(),
            },
            StreamError::Io(err) => StreamError::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }
}

impl StreamError {
    /// Helper for constructing contract violations.
    pub fn contract(msg: impl Into<String>) -> Self {
        StreamError::ContractViolation(msg.into())
    }

    /// Helper for constructing source failures.
    pub fn source_failure(msg: impl Into<String>) -> Self {
        StreamError::Source(msg.into())
    }

    /// Whether this error is a cancellation rather than an originating failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_sorted_message_names_both_loci() {
        let error = StreamError::NotSorted {
            previous: Locus::new(0, 20),
            current: Locus::new(0, 10),
        };
        let msg = error.to_string();
        assert!(msg.contains("0:10 observed after 0:20"));
    }

    #[test]
    fn cloned_io_error_keeps_kind_and_message() {
        let error = StreamError::from(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated block",
        ));
        match error.clone() {
            StreamError::Io(err) => {
                assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
                assert_eq!(err.to_string(), "truncated block");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancellation_is_distinguished() {
        let cancelled = StreamError::Cancelled {
            reason: "test".to_string(),
        };
        assert!(cancelled.is_cancellation());
        assert!(!StreamError::contract("bad").is_cancellation());
    }
}
