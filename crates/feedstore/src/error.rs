//! Error and Result types for feed storage operations.

use crate::kv::KvError;
use crate::types::FeedId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for feed storage operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// The error type for feed storage operations.
///
/// Every variant is reported to the immediate caller of the failing
/// operation; none of them is retried inside the engine.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The feed (or its metadata) does not exist.
    #[error("Feed not found: {0}")]
    NotFound(FeedId),

    /// A partition or metadata file is locked by another writer.
    #[error("File is locked by another writer: {}", path.display())]
    Locked {
        /// Path of the locked file.
        path: PathBuf,
    },

    /// The gap between the last written slot and the new slot is too large to pad.
    #[error("Padding of {requested} slots exceeds the maximum of {max}")]
    PaddingTooLarge {
        /// Number of gap slots that would have been written.
        requested: u64,
        /// Maximum number of gap slots accepted in one write.
        max: u64,
    },

    /// Timestamp lies outside the accepted write window.
    #[error("Timestamp {time} outside accepted range [{min}, {max}]")]
    OutOfRange {
        /// Rejected timestamp (unix seconds).
        time: i64,
        /// Oldest accepted timestamp.
        min: i64,
        /// Newest accepted timestamp.
        max: i64,
    },

    /// A read would return more points than the engine serves in one request.
    #[error(
        "Request datapoint limit reached ({limit}), increase request interval or time range, requested datapoints = {requested}"
    )]
    CapacityExceeded {
        /// Number of points the request implies.
        requested: u64,
        /// Engine point cap.
        limit: u64,
    },

    /// The key-value store rejected or failed an operation.
    #[error("Key-value backend unavailable: {0}")]
    BackendUnavailable(#[from] KvError),

    /// The native interval is not on the layer ladder.
    #[error("Unsupported feed interval: {0}s")]
    InvalidInterval(u32),

    /// Query range is inverted.
    #[error("End must be greater than start (start={start}, end={end})")]
    InvalidRange {
        /// Range start.
        start: i64,
        /// Range end.
        end: i64,
    },

    /// Metadata file could not be decoded.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Operation is not offered by this backend.
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
