//! The storage contract shared by every backend.

use crate::csv::CsvRequest;
use crate::error::Result;
use crate::types::{CreateOptions, DataPoint, DataQuery, FeedId};
use std::io::Write;

/// Storage contract implemented by the file backend
/// ([`FiwaEngine`](crate::fiwa::FiwaEngine)) and the key-value backend
/// ([`KvEngine`](crate::kv::KvEngine)).
///
/// All operations are blocking. Errors are reported for the single failing
/// call and never retried, except for unprocessed batch items inside
/// [`KvEngine::flush`](crate::kv::KvEngine::flush).
pub trait FeedEngine {
    /// Creates storage for a feed. Creating an existing feed succeeds without
    /// touching its data.
    fn create(&mut self, id: FeedId, options: &CreateOptions) -> Result<()>;

    /// Writes one sample. `time` is in unix seconds.
    fn post(&mut self, id: FeedId, time: i64, value: f64) -> Result<()>;

    /// Back-fills one sample. Identical to [`post`](Self::post).
    fn update(&mut self, id: FeedId, time: i64, value: f64) -> Result<()> {
        self.post(id, time, value)
    }

    /// Reads `query` at the requested resolution. Returned times are unix milliseconds.
    fn get_data(&self, id: FeedId, query: &DataQuery) -> Result<Vec<DataPoint>>;

    /// Returns the most recent sample (time in unix seconds), or `None` for an empty feed.
    fn lastvalue(&self, id: FeedId) -> Result<Option<DataPoint>>;

    /// Removes the feed and all of its data.
    fn delete(&mut self, id: FeedId) -> Result<()>;

    /// Returns the storage occupied by the feed in bytes.
    fn get_feed_size(&self, id: FeedId) -> Result<u64>;

    /// Streams the raw stored samples from `byte_offset` into `out`.
    /// Returns the number of bytes written.
    fn export(&self, id: FeedId, byte_offset: u64, out: &mut dyn Write) -> Result<u64>;

    /// Writes a CSV rendition of the range into `out`. Returns the number of lines written.
    fn csv_export(&self, id: FeedId, request: &CsvRequest<'_>, out: &mut dyn Write)
        -> Result<u64>;
}
