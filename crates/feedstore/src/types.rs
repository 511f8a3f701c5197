//! Shared types for both storage backends.

use crate::error::{FeedError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Feed identifier.
pub type FeedId = u32;

/// Number of sample slots held by one partition.
pub const WEEK_NPOINTS: i64 = 604_800;

/// A single timestamped sample.
///
/// The unit of `time` depends on where the point comes from: writes and
/// [`lastvalue`](crate::FeedEngine::lastvalue) use unix seconds, while
/// [`get_data`](crate::FeedEngine::get_data) returns unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    /// Timestamp.
    pub time: i64,
    /// Sample value, `None` when there is no data.
    pub value: Option<f64>,
}

impl DataPoint {
    /// Creates a data point.
    pub fn new(time: i64, value: Option<f64>) -> Self {
        Self { time, value }
    }

    /// Creates a data point that carries a value.
    pub fn some(time: i64, value: f64) -> Self {
        Self {
            time,
            value: Some(value),
        }
    }
}

/// Options for feed creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    /// Native sampling interval in seconds.
    pub interval: u32,
}

impl CreateOptions {
    /// Creates options for a feed sampled every `interval` seconds.
    pub fn new(interval: u32) -> Self {
        Self { interval }
    }
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { interval: 10 }
    }
}

/// A range read request.
///
/// `start_ms`/`end_ms` are unix milliseconds, `interval` is the output
/// resolution in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataQuery {
    /// Range start in unix milliseconds.
    pub start_ms: i64,
    /// Range end in unix milliseconds (inclusive).
    pub end_ms: i64,
    /// Output interval in seconds.
    pub interval: u32,
    /// Omit points without a value instead of returning nulls.
    pub skip_missing: bool,
    /// Only accept nearest samples closer than `interval` to the query time.
    pub limit_interval: bool,
}

impl DataQuery {
    /// Creates a query that returns nulls for missing data.
    pub fn new(start_ms: i64, end_ms: i64, interval: u32) -> Self {
        Self {
            start_ms,
            end_ms,
            interval,
            skip_missing: false,
            limit_interval: false,
        }
    }

    /// Sets whether points without a value are omitted.
    pub fn skip_missing(mut self, skip: bool) -> Self {
        self.skip_missing = skip;
        self
    }

    /// Sets whether nearest matches are limited to one interval of distance.
    pub fn limit_interval(mut self, limit: bool) -> Self {
        self.limit_interval = limit;
        self
    }

    /// Returns the range in unix seconds, rejecting inverted ranges.
    pub fn range_secs(&self) -> Result<(i64, i64)> {
        let start = self.start_ms / 1000;
        let end = self.end_ms / 1000;
        if end < start {
            return Err(FeedError::InvalidRange { start, end });
        }
        Ok((start, end))
    }
}

/// Returns the current unix time in seconds.
pub fn current_unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
