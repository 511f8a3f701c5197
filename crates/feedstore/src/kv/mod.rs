//! Key-value backend: raw samples in one table per feed.
//!
//! Writes go straight to the store ([`FeedEngine::post`]) or through the
//! in-memory [`WriteBuffer`] ([`KvEngine::buffer_post`] / [`KvEngine::flush`]).
//! Reads step through the range at the output interval and pick the nearest
//! stored sample for every step.

pub mod buffer;
pub mod client;
pub mod search;

pub use buffer::{LastValueCache, WriteBuffer};
pub use client::{
    week_index, KvClient, KvError, LastValueItem, MemoryKvStore, SampleItem, TableDescription,
    TableSchema, WindowQuery,
};
pub use search::nearest_index;

use crate::csv::{CsvRequest, CsvWriter, FixedOffsetFormatter, TimeFormatter};
use crate::engine::FeedEngine;
use crate::error::{FeedError, Result};
use crate::types::{CreateOptions, DataPoint, DataQuery, FeedId, WEEK_NPOINTS};
use std::io::Write;
use tracing::{debug, info, warn};

/// Bytes accounted per stored sample.
pub const ITEM_SIZE: u64 = 8;

/// Configuration of the key-value backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    /// Prefix of per-feed table names.
    pub table_prefix: String,
    /// Name of the shared last-value table.
    pub last_values_table: String,
    /// Largest number of points a single read may return.
    pub max_datapoints: usize,
    /// Items fetched per window query.
    pub window_limit: usize,
    /// Items per batch write.
    pub batch_size: usize,
    /// Read capacity provisioned for new feed tables.
    pub read_capacity: u64,
    /// Write capacity provisioned for new feed tables.
    pub write_capacity: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            table_prefix: "feed_".to_string(),
            last_values_table: "last_values".to_string(),
            max_datapoints: 8928,
            window_limit: 60_000,
            batch_size: 25,
            read_capacity: 10,
            write_capacity: 10,
        }
    }
}

/// Sliding window of fetched samples used by the nearest-point reads.
///
/// Holds the last sample before the current fetch (if any) followed by one
/// fetched run, so a target is compared against both of its neighbours.
struct SampleCursor<'a, C: KvClient> {
    client: &'a C,
    table: &'a str,
    limit: usize,
    items: Vec<SampleItem>,
    next_from: i64,
}

impl<'a, C: KvClient> SampleCursor<'a, C> {
    fn new(client: &'a C, table: &'a str, limit: usize, from: i64) -> Self {
        Self {
            client,
            table,
            limit,
            items: Vec::new(),
            next_from: from,
        }
    }

    /// Fetches forward until the window reaches `target` or the next
    /// unfetched time passes `horizon`.
    fn seek(&mut self, target: i64, horizon: i64) -> std::result::Result<&[SampleItem], KvError> {
        loop {
            if self.items.last().is_some_and(|s| s.time >= target) || self.next_from > horizon {
                return Ok(self.items.as_slice());
            }

            let week = week_index(self.next_from);
            let query = WindowQuery {
                week_index: week,
                from_time: self.next_from,
                limit: self.limit,
            };
            let fetched = self.client.query_samples(self.table, &query)?;
            match fetched.last() {
                Some(last) => {
                    self.next_from = last.time + 1;
                    let carry = self.items.last().copied();
                    self.items = carry.into_iter().chain(fetched).collect();
                }
                None => self.next_from = week * WEEK_NPOINTS + 1,
            }
        }
    }
}

/// Key-value backend of the storage contract.
///
/// # Example
///
/// ```rust
/// use feedstore::kv::{KvConfig, KvEngine, MemoryKvStore};
/// use feedstore::{CreateOptions, DataQuery, FeedEngine};
///
/// let mut engine = KvEngine::new(MemoryKvStore::new(), KvConfig::default());
/// engine.create(1, &CreateOptions::default()).unwrap();
/// for t in 1..=3 {
///     engine.buffer_post(1, t * 10, t as f64).unwrap();
/// }
/// assert_eq!(engine.flush().unwrap(), 24);
///
/// let data = engine.get_data(1, &DataQuery::new(10_000, 30_000, 10)).unwrap();
/// assert_eq!(data.len(), 3);
/// ```
pub struct KvEngine<C: KvClient> {
    client: C,
    config: KvConfig,
    buffer: WriteBuffer,
    formatter: Box<dyn TimeFormatter>,
}

impl<C: KvClient> KvEngine<C> {
    /// Creates an engine using the built-in fixed-offset time formatter.
    pub fn new(client: C, config: KvConfig) -> Self {
        Self::with_formatter(client, config, Box::new(FixedOffsetFormatter))
    }

    /// Creates an engine with a custom time formatter.
    pub fn with_formatter(client: C, config: KvConfig, formatter: Box<dyn TimeFormatter>) -> Self {
        let buffer = WriteBuffer::new(config.batch_size);
        Self {
            client,
            config,
            buffer,
            formatter,
        }
    }

    /// Store client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Mutable store client.
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Engine configuration.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// Pending write buffer.
    pub fn buffer(&self) -> &WriteBuffer {
        &self.buffer
    }

    /// Name of the table holding `id`.
    pub fn table_name(&self, id: FeedId) -> String {
        format!("{}{}", self.config.table_prefix, id)
    }

    /// Buffers one sample for the next [`flush`](Self::flush).
    ///
    /// A sample at or before the feed's last known time is dropped with a
    /// warning. The value is returned unchanged in both cases.
    pub fn buffer_post(&mut self, id: FeedId, time: i64, value: f64) -> Result<f64> {
        let last = match self.buffer.last_values().get(id) {
            Some(cached) => Some(cached),
            None => {
                let stored = self
                    .client
                    .get_last_value(&self.config.last_values_table, id)
                    .map_err(|e| self.backend_error(id, e))?;
                if let Some(record) = stored {
                    self.buffer
                        .last_values_mut()
                        .set(id, record.time, record.value);
                }
                stored
            }
        };

        if let Some(last) = last.filter(|last| time <= last.time) {
            warn!(
                "Feed {}: buffered sample at {} is not after last value at {}, nothing saved",
                id, time, last.time
            );
            return Ok(value);
        }

        self.buffer.push(id, SampleItem::new(time, value));
        self.buffer.last_values_mut().set(id, time, value);
        Ok(value)
    }

    /// Writes every buffered batch. Returns the bytes written.
    ///
    /// Items reported as unprocessed are resent until the store accepts them
    /// all, without backoff or limit. After a batch is accepted its last
    /// item becomes the feed's durable last value. On error the failing
    /// batch and everything after it stay buffered.
    pub fn flush(&mut self) -> Result<u64> {
        let mut written = 0u64;
        while let Some((id, batch)) = self.buffer.pop_batch() {
            let table = self.table_name(id);
            if let Err(e) = self.write_batch(&table, &batch) {
                self.buffer.restore_batch(id, batch);
                return Err(self.backend_error(id, e));
            }
            written += batch.len() as u64 * ITEM_SIZE;

            if let Some(last) = batch.last() {
                let record = LastValueItem {
                    feed_id: id,
                    time: last.time,
                    value: last.value,
                };
                self.client
                    .put_last_value(&self.config.last_values_table, &record)
                    .map_err(|e| self.backend_error(id, e))?;
            }
        }
        debug!("Flushed {} bytes", written);
        Ok(written)
    }

    fn write_batch(&mut self, table: &str, batch: &[SampleItem]) -> std::result::Result<(), KvError> {
        let mut unprocessed = self.client.batch_write_samples(table, batch)?;
        while !unprocessed.is_empty() {
            debug!(
                "Table {}: resending {} unprocessed items",
                table,
                unprocessed.len()
            );
            unprocessed = self.client.batch_write_samples(table, &unprocessed)?;
        }
        Ok(())
    }

    fn backend_error(&self, id: FeedId, error: KvError) -> FeedError {
        match error {
            KvError::TableNotFound(table) => {
                debug!("Feed {}: table {} not found", id, table);
                FeedError::NotFound(id)
            }
            e => {
                warn!("Feed {}: key-value operation failed: {}", id, e);
                FeedError::BackendUnavailable(e)
            }
        }
    }

    fn cursor<'a>(&'a self, table: &'a str, from: i64) -> SampleCursor<'a, C> {
        SampleCursor::new(&self.client, table, self.config.window_limit, from)
    }
}

impl<C: KvClient> FeedEngine for KvEngine<C> {
    fn create(&mut self, id: FeedId, _options: &CreateOptions) -> Result<()> {
        let schema = TableSchema::feed_table(
            self.table_name(id),
            self.config.read_capacity,
            self.config.write_capacity,
        );
        match self.client.create_table(&schema) {
            Ok(()) => {
                info!("Created table {} for feed {}", schema.name, id);
                Ok(())
            }
            Err(KvError::TableExists(name)) => {
                debug!("Table {} already exists", name);
                Ok(())
            }
            Err(e) => Err(self.backend_error(id, e)),
        }
    }

    fn post(&mut self, id: FeedId, time: i64, value: f64) -> Result<()> {
        let table = self.table_name(id);
        self.client
            .put_sample(&table, &SampleItem::new(time, value))
            .map_err(|e| self.backend_error(id, e))?;

        let record = LastValueItem {
            feed_id: id,
            time,
            value,
        };
        self.client
            .put_last_value(&self.config.last_values_table, &record)
            .map_err(|e| self.backend_error(id, e))?;
        self.buffer.last_values_mut().advance(id, time, value);
        Ok(())
    }

    fn get_data(&self, id: FeedId, query: &DataQuery) -> Result<Vec<DataPoint>> {
        let (start, end) = query.range_secs()?;
        let interval = i64::from(query.interval.max(1));

        let requested = ((end - start) as f64 / interval as f64).round() as u64;
        let limit = self.config.max_datapoints as u64;
        if requested > limit {
            return Err(FeedError::CapacityExceeded { requested, limit });
        }

        let table = self.table_name(id);
        let mut cursor = self.cursor(&table, start - interval);
        let mut data = Vec::with_capacity(requested as usize + 1);
        let mut last_time = None;
        let mut time = start;
        while time <= end {
            let window = cursor
                .seek(time, time + interval)
                .map_err(|e| self.backend_error(id, e))?;
            if let Some(sample) = nearest_index(window, time, |s| s.time).map(|i| window[i]) {
                let (point_time, value) = if query.limit_interval {
                    let close = (sample.time - time).abs() < interval;
                    (time, close.then_some(sample.value))
                } else {
                    (sample.time, Some(sample.value))
                };

                if last_time != Some(point_time) && (value.is_some() || !query.skip_missing) {
                    data.push(DataPoint::new(point_time * 1000, value));
                }
                last_time = Some(point_time);
            }
            time += interval;
        }
        Ok(data)
    }

    fn lastvalue(&self, id: FeedId) -> Result<Option<DataPoint>> {
        let record = self
            .client
            .get_last_value(&self.config.last_values_table, id)
            .map_err(|e| self.backend_error(id, e))?;
        Ok(record.map(|r| DataPoint::some(r.time, r.value)))
    }

    fn delete(&mut self, id: FeedId) -> Result<()> {
        let table = self.table_name(id);
        self.client
            .delete_table(&table)
            .map_err(|e| self.backend_error(id, e))?;
        self.client
            .delete_last_value(&self.config.last_values_table, id)
            .map_err(|e| self.backend_error(id, e))?;
        self.buffer.discard(id);
        info!("Deleted table {} of feed {}", table, id);
        Ok(())
    }

    fn get_feed_size(&self, id: FeedId) -> Result<u64> {
        let description = self
            .client
            .describe_table(&self.table_name(id))
            .map_err(|e| self.backend_error(id, e))?;
        Ok(description.item_count * ITEM_SIZE)
    }

    fn export(&self, _id: FeedId, _byte_offset: u64, _out: &mut dyn Write) -> Result<u64> {
        Err(FeedError::Unsupported("raw export"))
    }

    fn csv_export(
        &self,
        id: FeedId,
        request: &CsvRequest<'_>,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let interval = i64::from(request.interval.max(1));
        let (start, end) = (request.start, request.end);
        if end <= start {
            return Ok(0);
        }
        let steps = (end - start + interval - 1) / interval;

        let table = self.table_name(id);
        let mut cursor = self.cursor(&table, start - interval);
        let mut writer = CsvWriter::new(out, self.formatter.as_ref(), request);
        let mut last_time = None;
        for step in 0..steps {
            let time = start + step * interval;
            let window = cursor
                .seek(time, time + interval)
                .map_err(|e| self.backend_error(id, e))?;
            if let Some(sample) = nearest_index(window, time, |s| s.time).map(|i| window[i]) {
                if last_time.is_none_or(|last| sample.time > last) {
                    writer.write_line(sample.time, sample.value)?;
                    last_time = Some(sample.time);
                }
            }
        }
        Ok(writer.finish()?)
    }
}
