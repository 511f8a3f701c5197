//! Partition files: fixed-slot float arrays keyed by (layer, partition id).
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (4 bytes)                                            │
//! │  - Point count: u32 LE = highest slot ever written           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Slots (4 bytes each, slot k at offset 4k, k ≥ 1)            │
//! │  - IEEE-754 f32 LE, NaN = no sample                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A partition covers [`WEEK_NPOINTS`] slots of one layer. Its id is
//! `floor(t / (WEEK_NPOINTS × interval)) × interval`, so the first slot of
//! the partition is at time `id × WEEK_NPOINTS`. Files are named
//! `<layer>_<partition id>` inside the feed directory.

use crate::error::{FeedError, Result};
use crate::types::{FeedId, WEEK_NPOINTS};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of the point-count header in bytes.
pub const HEADER_SIZE: u64 = 4;

/// Size of one slot in bytes.
pub const SLOT_SIZE: u64 = 4;

/// Padding block size in bytes.
pub const PADDING_BLOCK_BYTES: u64 = 1024 * 1024;

/// Slots written per padding chunk.
pub const PADDING_BLOCK_SLOTS: u64 = PADDING_BLOCK_BYTES / SLOT_SIZE;

/// Largest gap that a single write may pad.
///
/// Counted in slots against twice the block size, which keeps a fresh
/// partition (up to [`WEEK_NPOINTS`] − 1 gap slots) paddable in one write.
pub const MAX_PADDING_SLOTS: u64 = 2 * PADDING_BLOCK_BYTES;

/// Slot arithmetic of the two historical engines, kept as a file-compatibility
/// marker.
///
/// [`PartitionPosition::locate`] snaps timestamps to the layer interval and
/// partition starts are multiples of [`WEEK_NPOINTS`] × interval, so the
/// in-partition offset is always a whole number of intervals. Both variants
/// therefore locate every timestamp in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotRounding {
    /// `slot = 1 + floor(offset / interval)`.
    #[default]
    Floor,
    /// `slot = 1 + ceil(offset / interval)`.
    Ceil,
}

impl SlotRounding {
    fn offset_slots(self, offset: i64, interval: i64) -> i64 {
        match self {
            Self::Floor => offset.div_euclid(interval),
            Self::Ceil => {
                let q = offset.div_euclid(interval);
                if offset.rem_euclid(interval) == 0 {
                    q
                } else {
                    q + 1
                }
            }
        }
    }
}

/// Location of a timestamp inside one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPosition {
    /// Timestamp snapped down to the layer interval.
    pub time: i64,
    /// Partition id.
    pub partition_id: i64,
    /// Slot inside the partition (1-based).
    pub slot: u32,
}

impl PartitionPosition {
    /// Locates `time` in a layer sampled every `interval` seconds.
    pub fn locate(time: i64, interval: u32, rounding: SlotRounding) -> Self {
        let interval = i64::from(interval);
        let time = time.div_euclid(interval) * interval;
        let partition_id = partition_id(time, interval);
        let offset = time - partition_start(partition_id);
        let slot = 1 + rounding.offset_slots(offset, interval);
        Self {
            time,
            partition_id,
            slot: slot as u32,
        }
    }
}

/// Returns the id of the partition holding `time` in a layer of `interval` seconds.
pub fn partition_id(time: i64, interval: i64) -> i64 {
    time.div_euclid(WEEK_NPOINTS * interval) * interval
}

/// Returns the time of the first slot of a partition.
pub fn partition_start(partition_id: i64) -> i64 {
    partition_id * WEEK_NPOINTS
}

/// Returns the time of `slot` in a partition.
pub fn slot_time(partition_id: i64, slot: u32, interval: u32) -> i64 {
    partition_start(partition_id) + (i64::from(slot) - 1) * i64::from(interval)
}

/// Builds the partition file name `<layer>_<partition id>`.
pub fn partition_file_name(layer: usize, partition_id: i64) -> String {
    format!("{}_{}", layer, partition_id)
}

/// Parses a partition file name for `layer`.
pub fn parse_partition_file_name(name: &str, layer: usize) -> Option<i64> {
    let (layer_part, id_part) = name.split_once('_')?;
    if layer_part.parse::<usize>().ok()? != layer {
        return None;
    }
    id_part.parse::<i64>().ok()
}

/// Takes a non-blocking exclusive advisory lock on `file`.
///
/// The lock is released when the file handle is dropped.
pub(crate) fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(FeedError::Locked {
            path: path.to_path_buf(),
        }),
        Err(TryLockError::Error(e)) => Err(FeedError::Io(e)),
    }
}

/// Locates partition files of all feeds under a data directory.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    data_dir: PathBuf,
    rounding: SlotRounding,
}

impl PartitionStore {
    /// Creates a partition store rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>, rounding: SlotRounding) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            rounding,
        }
    }

    /// Slot rounding policy used by this store.
    pub fn rounding(&self) -> SlotRounding {
        self.rounding
    }

    /// Locates `time` in a layer of `interval` seconds using this store's policy.
    pub fn locate(&self, time: i64, interval: u32) -> PartitionPosition {
        PartitionPosition::locate(time, interval, self.rounding)
    }

    /// Returns the path of a partition file.
    pub fn partition_path(&self, feed: FeedId, layer: usize, partition_id: i64) -> PathBuf {
        self.data_dir
            .join(feed.to_string())
            .join(partition_file_name(layer, partition_id))
    }

    /// Opens a partition for writing, creating it with a zero header if absent.
    ///
    /// The returned handle holds an exclusive lock until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::Locked` if another writer holds the file.
    pub fn open_or_create(
        &self,
        feed: FeedId,
        layer: usize,
        partition_id: i64,
    ) -> Result<PartitionFile> {
        let path = self.partition_path(feed, layer, partition_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if let Err(e) = lock_exclusive(&file, &path) {
            warn!(
                "Partition {} of feed {} layer {} is locked by another writer",
                partition_id, feed, layer
            );
            return Err(e);
        }

        let mut partition = PartitionFile { file, path };
        if partition.file.metadata()?.len() == 0 {
            debug!("Initializing partition {}", partition.path.display());
            partition.write_point_count(0)?;
        }
        Ok(partition)
    }

    /// Opens a partition for reading without locking.
    ///
    /// Returns `None` if the file is absent or holds no slots.
    pub fn open_read(
        &self,
        feed: FeedId,
        layer: usize,
        partition_id: i64,
    ) -> Result<Option<PartitionReader>> {
        let path = self.partition_path(feed, layer, partition_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() <= HEADER_SIZE {
            return Ok(None);
        }
        let point_count = read_header(&file)?;
        Ok(Some(PartitionReader { file, point_count }))
    }

    /// Returns the ids of all partitions of `layer`, ascending.
    pub fn partition_ids(&self, feed: FeedId, layer: usize) -> Result<Vec<i64>> {
        let dir = self.data_dir.join(feed.to_string());
        if !dir.is_dir() {
            return Err(FeedError::NotFound(feed));
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| parse_partition_file_name(name, layer))
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn read_header(file: &File) -> Result<u32> {
    let mut file = file;
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads up to `count` slots starting at `first_slot`. Slots past the end of
/// the file are not returned.
fn read_slots(file: &File, first_slot: u32, count: u64) -> Result<Vec<f32>> {
    let mut file = file;
    file.seek(SeekFrom::Start(u64::from(first_slot) * SLOT_SIZE))?;
    let mut buf = Vec::new();
    file.take(count * SLOT_SIZE).read_to_end(&mut buf)?;
    Ok(buf
        .chunks_exact(SLOT_SIZE as usize)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn encode_value(value: f64) -> [u8; 4] {
    if value.is_nan() {
        f32::NAN.to_le_bytes()
    } else {
        (value as f32).to_le_bytes()
    }
}

/// A locked, writable partition file.
#[derive(Debug)]
pub struct PartitionFile {
    file: File,
    path: PathBuf,
}

impl PartitionFile {
    /// Path of the partition file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the point-count header.
    pub fn read_point_count(&self) -> Result<u32> {
        read_header(&self.file)
    }

    fn write_point_count(&mut self, count: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&count.to_le_bytes())?;
        Ok(())
    }

    /// Writes one value at `slot`. NaN is stored as the canonical NaN pattern.
    pub fn write_point(&mut self, slot: u32, value: f64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(u64::from(slot) * SLOT_SIZE))?;
        self.file.write_all(&encode_value(value))?;
        Ok(())
    }

    /// Fills `count` NaN slots starting at `from_slot + 1`.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::PaddingTooLarge` if `count` exceeds
    /// [`MAX_PADDING_SLOTS`]; nothing is written in that case.
    pub fn pad_gap(&mut self, from_slot: u32, count: i64) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }
        let mut remaining = count as u64;
        if remaining > MAX_PADDING_SLOTS {
            return Err(FeedError::PaddingTooLarge {
                requested: remaining,
                max: MAX_PADDING_SLOTS,
            });
        }

        let block_slots = remaining.min(PADDING_BLOCK_SLOTS);
        let block: Vec<u8> = std::iter::repeat_n(f32::NAN.to_le_bytes(), block_slots as usize)
            .flatten()
            .collect();

        self.file
            .seek(SeekFrom::Start((u64::from(from_slot) + 1) * SLOT_SIZE))?;
        while remaining > 0 {
            let chunk = remaining.min(block_slots);
            self.file
                .write_all(&block[..(chunk * SLOT_SIZE) as usize])?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Raises the point-count header to `slot`. Returns true if it changed.
    pub fn update_point_count(&mut self, slot: u32) -> Result<bool> {
        if slot > self.read_point_count()? {
            self.write_point_count(slot)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads up to `count` slots starting at `first_slot`.
    pub fn read_slots(&self, first_slot: u32, count: u64) -> Result<Vec<f32>> {
        read_slots(&self.file, first_slot, count)
    }
}

/// An unlocked, read-only partition file.
///
/// Concurrent writers may be observed mid-write.
#[derive(Debug)]
pub struct PartitionReader {
    file: File,
    point_count: u32,
}

impl PartitionReader {
    /// Point count read when the partition was opened.
    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    /// Reads up to `count` slots starting at `first_slot`.
    pub fn read_slots(&self, first_slot: u32, count: u64) -> Result<Vec<f32>> {
        read_slots(&self.file, first_slot, count)
    }

    /// Copies the byte range `[from, to)` of the file into `out`.
    pub fn copy_range(&self, from: u64, to: u64, out: &mut dyn Write) -> Result<u64> {
        if to <= from {
            return Ok(0);
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(from))?;
        let mut reader = io::BufReader::with_capacity(8192, file.take(to - from));
        Ok(io::copy(&mut reader, out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with_feed(temp_dir: &TempDir, feed: FeedId) -> PartitionStore {
        fs::create_dir_all(temp_dir.path().join(feed.to_string())).unwrap();
        PartitionStore::new(temp_dir.path(), SlotRounding::Floor)
    }

    #[test]
    fn test_locate_first_slot() {
        let pos = PartitionPosition::locate(0, 10, SlotRounding::Floor);
        assert_eq!(pos.partition_id, 0);
        assert_eq!(pos.slot, 1);
    }

    #[test]
    fn test_locate_snaps_and_partitions() {
        let interval = 10u32;
        let span = WEEK_NPOINTS * 10;
        let pos = PartitionPosition::locate(span + 25, interval, SlotRounding::Floor);
        assert_eq!(pos.time, span + 20);
        assert_eq!(pos.partition_id, 10);
        assert_eq!(partition_start(pos.partition_id), span);
        assert_eq!(pos.slot, 3);
        assert_eq!(slot_time(pos.partition_id, pos.slot, interval), pos.time);
    }

    #[test]
    fn test_rounding_policies_agree_on_aligned_time() {
        let time = 1_700_000_000 / 60 * 60;
        assert_eq!(
            PartitionPosition::locate(time, 60, SlotRounding::Floor),
            PartitionPosition::locate(time, 60, SlotRounding::Ceil)
        );
        assert_eq!(SlotRounding::Ceil.offset_slots(25, 10), 3);
        assert_eq!(SlotRounding::Floor.offset_slots(25, 10), 2);
    }

    #[test]
    fn test_rounding_policies_agree_on_unaligned_time() {
        for interval in [1u32, 10, 60, 600, 3600] {
            for time in [1_700_000_001i64, 1_700_000_059, WEEK_NPOINTS * 60 + 7, -13] {
                assert_eq!(
                    PartitionPosition::locate(time, interval, SlotRounding::Floor),
                    PartitionPosition::locate(time, interval, SlotRounding::Ceil),
                    "time {} interval {}",
                    time,
                    interval
                );
            }
        }
    }

    #[test]
    fn test_file_name_roundtrip() {
        let name = partition_file_name(2, 600);
        assert_eq!(name, "2_600");
        assert_eq!(parse_partition_file_name(&name, 2), Some(600));
        assert_eq!(parse_partition_file_name(&name, 1), None);
        assert_eq!(parse_partition_file_name("7.meta", 0), None);
    }

    #[test]
    fn test_new_partition_has_zero_header() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        let partition = store.open_or_create(1, 0, 0).unwrap();
        assert_eq!(partition.read_point_count().unwrap(), 0);
        assert_eq!(fs::metadata(partition.path()).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_write_pad_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        let mut partition = store.open_or_create(1, 0, 0).unwrap();
        partition.write_point(1, 1.5).unwrap();
        assert!(partition.update_point_count(1).unwrap());
        partition.pad_gap(1, 3).unwrap();
        partition.write_point(5, 2.5).unwrap();
        assert!(partition.update_point_count(5).unwrap());
        assert!(!partition.update_point_count(3).unwrap());

        let slots = partition.read_slots(1, 5).unwrap();
        assert_eq!(slots.len(), 5);
        assert_eq!(slots[0], 1.5);
        assert!(slots[1..4].iter().all(|v| v.is_nan()));
        assert_eq!(slots[4], 2.5);
        assert_eq!(partition.read_point_count().unwrap(), 5);
    }

    #[test]
    fn test_pad_gap_zero_or_negative_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        let mut partition = store.open_or_create(1, 0, 0).unwrap();
        partition.pad_gap(0, 0).unwrap();
        partition.pad_gap(0, -4).unwrap();
        assert_eq!(fs::metadata(partition.path()).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_pad_gap_too_large() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        let mut partition = store.open_or_create(1, 0, 0).unwrap();
        let result = partition.pad_gap(0, MAX_PADDING_SLOTS as i64 + 1);
        assert!(matches!(result, Err(FeedError::PaddingTooLarge { .. })));
        assert_eq!(fs::metadata(partition.path()).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_pad_gap_spans_multiple_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        let mut partition = store.open_or_create(1, 0, 0).unwrap();
        let count = PADDING_BLOCK_SLOTS + 10;
        partition.pad_gap(0, count as i64).unwrap();

        let len = fs::metadata(partition.path()).unwrap().len();
        assert_eq!(len, HEADER_SIZE + count * SLOT_SIZE);
        let tail = partition.read_slots(count as u32 - 1, 2).unwrap();
        assert!(tail.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_second_writer_is_locked() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        let held = store.open_or_create(1, 0, 0).unwrap();
        let result = store.open_or_create(1, 0, 0);
        assert!(matches!(result, Err(FeedError::Locked { .. })));

        drop(held);
        assert!(store.open_or_create(1, 0, 0).is_ok());
    }

    #[test]
    fn test_open_read_absent_and_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        assert!(store.open_read(1, 0, 0).unwrap().is_none());
        drop(store.open_or_create(1, 0, 0).unwrap());
        assert!(store.open_read(1, 0, 0).unwrap().is_none());
    }

    #[test]
    fn test_partition_ids_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_feed(&temp_dir, 1);

        for id in [600, 0, 60] {
            drop(store.open_or_create(1, 0, id).unwrap());
        }
        drop(store.open_or_create(1, 1, 3600).unwrap());

        assert_eq!(store.partition_ids(1, 0).unwrap(), vec![0, 60, 600]);
        assert_eq!(store.partition_ids(1, 1).unwrap(), vec![3600]);
        assert!(matches!(
            store.partition_ids(2, 0),
            Err(FeedError::NotFound(2))
        ));
    }
}
