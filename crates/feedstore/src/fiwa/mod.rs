//! Partitioned flat-file backend with a cascading averaging pyramid.
//!
//! ## Directory Layout
//!
//! ```text
//! <data_dir>/
//! ├── 7/
//! │   ├── 7.meta        FeedMetadata record
//! │   ├── 0_1650        layer 0 (10s) partition 1650
//! │   ├── 1_2940        layer 1 (60s) partition 2940
//! │   ├── 2_1200        layer 2 (600s) partition 1200
//! │   └── 3_0           layer 3 (3600s) partition 0
//! └── 8/
//!     └── ...
//! ```
//!
//! Every post writes layer 0 and re-averages the affected bucket of every
//! coarser layer. Reads pick the coarsest layer that still resolves the
//! requested output interval.

pub mod meta;
pub mod partition;
pub mod reader;
pub mod writer;

pub use meta::{layer_ladder, FeedMetadata, MetaStore, MAX_LAYERS};
pub use partition::{PartitionPosition, PartitionStore, SlotRounding};
pub use reader::DmyMode;

use crate::csv::{CsvRequest, CsvWriter, FixedOffsetFormatter, TimeFormatter};
use crate::engine::FeedEngine;
use crate::error::{FeedError, Result};
use crate::types::{current_unix_time, CreateOptions, DataPoint, DataQuery, FeedId};
use reader::RangeResampler;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use writer::CascadingWriter;

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/fiwa";

/// Default oldest accepted write (5 years).
pub const DEFAULT_MAX_PAST: Duration = Duration::from_secs(5 * 365 * 24 * 3600);

/// Default newest accepted write (48 hours).
pub const DEFAULT_MAX_FUTURE: Duration = Duration::from_secs(48 * 3600);

/// Configuration of the file backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiwaConfig {
    /// Root directory holding one sub-directory per feed.
    pub data_dir: PathBuf,
    /// Slot arithmetic used to locate samples in partitions.
    pub slot_rounding: SlotRounding,
    /// Largest number of points a single read may return, `None` for no cap.
    pub max_datapoints: Option<usize>,
    /// How far in the past a post may be.
    pub max_past: Duration,
    /// How far in the future a post may be.
    pub max_future: Duration,
}

impl Default for FiwaConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            slot_rounding: SlotRounding::default(),
            max_datapoints: None,
            max_past: DEFAULT_MAX_PAST,
            max_future: DEFAULT_MAX_FUTURE,
        }
    }
}

impl FiwaConfig {
    /// Creates a configuration rooted at `data_dir` with default limits.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the slot rounding policy recorded for the data directory.
    pub fn with_slot_rounding(mut self, rounding: SlotRounding) -> Self {
        self.slot_rounding = rounding;
        self
    }

    /// Sets the read point cap.
    pub fn with_max_datapoints(mut self, max: Option<usize>) -> Self {
        self.max_datapoints = max;
        self
    }
}

/// File backend of the storage contract.
///
/// # Example
///
/// ```rust
/// use feedstore::fiwa::{FiwaConfig, FiwaEngine};
/// use feedstore::{current_unix_time, CreateOptions, DataQuery, FeedEngine};
/// use tempfile::TempDir;
///
/// let temp_dir = TempDir::new().unwrap();
/// let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));
/// engine.create(1, &CreateOptions::new(60)).unwrap();
///
/// let now = current_unix_time() / 60 * 60;
/// engine.post(1, now, 21.5).unwrap();
///
/// let query = DataQuery::new(now * 1000, now * 1000, 60);
/// let data = engine.get_data(1, &query).unwrap();
/// assert_eq!(data[0].value, Some(21.5));
/// ```
pub struct FiwaEngine {
    config: FiwaConfig,
    meta: MetaStore,
    partitions: PartitionStore,
    formatter: Box<dyn TimeFormatter>,
}

impl FiwaEngine {
    /// Creates an engine using the built-in fixed-offset time formatter.
    pub fn new(config: FiwaConfig) -> Self {
        Self::with_formatter(config, Box::new(FixedOffsetFormatter))
    }

    /// Creates an engine with a custom time formatter.
    pub fn with_formatter(config: FiwaConfig, formatter: Box<dyn TimeFormatter>) -> Self {
        let meta = MetaStore::new(&config.data_dir);
        let partitions = PartitionStore::new(&config.data_dir, config.slot_rounding);
        Self {
            config,
            meta,
            partitions,
            formatter,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &FiwaConfig {
        &self.config
    }

    /// Loads the metadata of a feed.
    pub fn get_meta(&self, id: FeedId) -> Result<FeedMetadata> {
        self.meta.get_meta(id)
    }

    /// Streams the raw slots of any layer, see [`FeedEngine::export`].
    pub fn export_layer(
        &self,
        id: FeedId,
        layer: usize,
        byte_offset: u64,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let meta = self.meta.get_meta(id)?;
        self.resampler().export_layer(&meta, layer, byte_offset, out)
    }

    /// Returns daily, weekly or monthly averages in `timezone`.
    ///
    /// The start of the range is moved back to the local start of its day,
    /// week (Monday) or month. `query.interval` is ignored.
    pub fn get_data_dmy(
        &self,
        id: FeedId,
        query: &DataQuery,
        mode: DmyMode,
        timezone: &str,
    ) -> Result<Vec<DataPoint>> {
        let meta = self.meta.get_meta(id)?;
        self.resampler()
            .get_data_dmy(&meta, query, mode, self.formatter.as_ref(), timezone)
    }

    fn resampler(&self) -> RangeResampler<'_> {
        RangeResampler::new(&self.partitions, self.config.max_datapoints)
    }

    fn check_time(&self, id: FeedId, time: i64) -> Result<()> {
        let now = current_unix_time();
        let min = now - self.config.max_past.as_secs() as i64;
        let max = now + self.config.max_future.as_secs() as i64;
        if time < min || time > max {
            warn!(
                "Feed {}: timestamp {} outside accepted range [{}, {}]",
                id, time, min, max
            );
            return Err(FeedError::OutOfRange { time, min, max });
        }
        Ok(())
    }
}

impl FeedEngine for FiwaEngine {
    fn create(&mut self, id: FeedId, options: &CreateOptions) -> Result<()> {
        if self.meta.exists(id) {
            debug!("Feed {} already exists", id);
            return Ok(());
        }
        let meta = FeedMetadata::for_interval(id, options.interval.max(1))?;
        self.meta.create_meta(&meta)?;
        info!("Created feed {} with layers {:?}", id, meta.intervals());
        Ok(())
    }

    fn post(&mut self, id: FeedId, time: i64, value: f64) -> Result<()> {
        self.check_time(id, time)?;
        let mut meta = self.meta.get_meta(id)?;
        CascadingWriter::new(&self.meta, &self.partitions).post(&mut meta, time, value)
    }

    fn get_data(&self, id: FeedId, query: &DataQuery) -> Result<Vec<DataPoint>> {
        let meta = self.meta.get_meta(id)?;
        self.resampler().get_data(&meta, query)
    }

    fn lastvalue(&self, id: FeedId) -> Result<Option<DataPoint>> {
        let meta = self.meta.get_meta(id)?;
        self.resampler().lastvalue(&meta)
    }

    fn delete(&mut self, id: FeedId) -> Result<()> {
        let dir = self.meta.feed_dir(id);
        if !dir.is_dir() {
            return Err(FeedError::NotFound(id));
        }
        fs::remove_dir_all(&dir)?;
        info!("Deleted feed {}", id);
        Ok(())
    }

    fn get_feed_size(&self, id: FeedId) -> Result<u64> {
        let dir = self.meta.feed_dir(id);
        if !dir.is_dir() {
            return Err(FeedError::NotFound(id));
        }
        let mut size = 0;
        for entry in fs::read_dir(&dir)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                size += metadata.len();
            }
        }
        Ok(size)
    }

    fn export(&self, id: FeedId, byte_offset: u64, out: &mut dyn Write) -> Result<u64> {
        self.export_layer(id, 0, byte_offset, out)
    }

    fn csv_export(
        &self,
        id: FeedId,
        request: &CsvRequest<'_>,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let query = DataQuery::new(request.start * 1000, request.end * 1000, request.interval)
            .skip_missing(true);
        let data = self.get_data(id, &query)?;

        let mut writer = CsvWriter::new(out, self.formatter.as_ref(), request);
        for point in &data {
            if let Some(value) = point.value {
                writer.write_line(point.time / 1000, value)?;
            }
        }
        Ok(writer.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hour_base() -> i64 {
        current_unix_time() / 3600 * 3600 - 86_400
    }

    #[test]
    fn test_config_defaults() {
        let config = FiwaConfig::default();
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.slot_rounding, SlotRounding::Floor);
        assert_eq!(config.max_datapoints, None);
        assert_eq!(config.max_future, Duration::from_secs(172_800));
    }

    #[test]
    fn test_create_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));

        engine.create(3, &CreateOptions::new(10)).unwrap();
        engine.create(3, &CreateOptions::new(3600)).unwrap();
        assert_eq!(engine.get_meta(3).unwrap().intervals(), &[10, 60, 600, 3600]);
    }

    #[test]
    fn test_create_rejects_off_ladder_interval() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));

        assert!(matches!(
            engine.create(3, &CreateOptions::new(7)),
            Err(FeedError::InvalidInterval(7))
        ));
        engine.create(4, &CreateOptions::new(0)).unwrap();
        assert_eq!(engine.get_meta(4).unwrap().interval(0), 1);
    }

    #[test]
    fn test_post_out_of_range() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));
        engine.create(1, &CreateOptions::new(60)).unwrap();

        let now = current_unix_time();
        assert!(matches!(
            engine.post(1, now + 3 * 86_400, 1.0),
            Err(FeedError::OutOfRange { .. })
        ));
        assert!(matches!(
            engine.post(1, now - 6 * 365 * 86_400, 1.0),
            Err(FeedError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_post_unknown_feed() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));
        assert!(matches!(
            engine.post(9, hour_base(), 1.0),
            Err(FeedError::NotFound(9))
        ));
    }

    #[test]
    fn test_size_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));
        engine.create(1, &CreateOptions::new(3600)).unwrap();
        let meta_size = engine.get_feed_size(1).unwrap();
        assert_eq!(meta_size, 16);

        engine.post(1, hour_base(), 1.0).unwrap();
        assert!(engine.get_feed_size(1).unwrap() > meta_size);

        engine.delete(1).unwrap();
        assert!(matches!(engine.delete(1), Err(FeedError::NotFound(1))));
        assert!(matches!(engine.get_feed_size(1), Err(FeedError::NotFound(1))));
    }

    #[test]
    fn test_csv_export_skips_missing() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));
        engine.create(1, &CreateOptions::new(60)).unwrap();

        let base = hour_base();
        engine.post(1, base, 1.0).unwrap();
        engine.post(1, base + 120, 2.5).unwrap();

        let request = CsvRequest::new(base, base + 180, 60);
        let mut out = Vec::new();
        let lines = engine.csv_export(1, &request, &mut out).unwrap();
        assert_eq!(lines, 2);

        let text = String::from_utf8(out).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert!(rows[0].ends_with(",1.00"));
        assert!(rows[1].ends_with(",2.50"));
    }
}
