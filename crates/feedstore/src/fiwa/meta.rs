//! Feed metadata: layer ladder, fixed-width record and the metadata store.
//!
//! ## Record Layout
//!
//! ```text
//! Offset      Size        Field
//! ------      ----        -----
//! 0x00        4           id (u32 LE)
//! 0x04        4           layer_count (u32 LE)
//! 0x08        4 × n       write_cursor[n] (u32 LE, legacy npoints cache)
//! 0x08+4n     4 × n       interval[n] (u32 LE)
//! ```

use crate::error::{FeedError, Result};
use crate::fiwa::partition::lock_exclusive;
use crate::types::FeedId;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum number of layers in the averaging pyramid.
pub const MAX_LAYERS: usize = 4;

/// Metadata file extension.
const META_EXTENSION: &str = "meta";

/// Returns the layer intervals for a feed sampled every `interval` seconds,
/// or `None` if the interval is not on the ladder.
pub fn layer_ladder(interval: u32) -> Option<Vec<u32>> {
    let coarser: &[u32] = match interval {
        1 | 5 | 10 | 15 | 20 | 30 => &[60, 600, 3600],
        60 | 120 | 300 => &[600, 3600],
        600 | 1200 | 1800 => &[3600],
        3600 => &[],
        _ => return None,
    };
    let mut intervals = Vec::with_capacity(coarser.len() + 1);
    intervals.push(interval);
    intervals.extend_from_slice(coarser);
    Some(intervals)
}

/// Fixed-shape descriptor of a feed's averaging pyramid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMetadata {
    id: FeedId,
    intervals: Vec<u32>,
    write_cursor: Vec<u32>,
}

impl FeedMetadata {
    /// Creates metadata with explicit intervals and zeroed write cursors.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::InvalidMetadata` if the layer count is outside
    /// `1..=4` or the intervals are not strictly increasing.
    pub fn new(id: FeedId, intervals: Vec<u32>) -> Result<Self> {
        let write_cursor = vec![0; intervals.len()];
        Self::with_cursors(id, intervals, write_cursor)
    }

    /// Creates metadata for a native interval using the layer ladder.
    pub fn for_interval(id: FeedId, interval: u32) -> Result<Self> {
        let intervals = layer_ladder(interval).ok_or(FeedError::InvalidInterval(interval))?;
        Self::new(id, intervals)
    }

    fn with_cursors(id: FeedId, intervals: Vec<u32>, write_cursor: Vec<u32>) -> Result<Self> {
        if intervals.is_empty() || intervals.len() > MAX_LAYERS {
            return Err(FeedError::InvalidMetadata(format!(
                "layer count {} outside [1, {}]",
                intervals.len(),
                MAX_LAYERS
            )));
        }
        if intervals[0] == 0 || intervals.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FeedError::InvalidMetadata(format!(
                "intervals {:?} must be positive and strictly increasing",
                intervals
            )));
        }
        debug_assert_eq!(intervals.len(), write_cursor.len());
        Ok(Self {
            id,
            intervals,
            write_cursor,
        })
    }

    /// Feed id.
    pub fn id(&self) -> FeedId {
        self.id
    }

    /// Number of layers.
    pub fn layer_count(&self) -> usize {
        self.intervals.len()
    }

    /// Interval of `layer` in seconds.
    pub fn interval(&self, layer: usize) -> u32 {
        self.intervals[layer]
    }

    /// All layer intervals, finest first.
    pub fn intervals(&self) -> &[u32] {
        &self.intervals
    }

    /// Cached last written slot of `layer`'s open partition.
    pub fn write_cursor(&self, layer: usize) -> u32 {
        self.write_cursor[layer]
    }

    /// Updates the cached write cursor of `layer`.
    pub fn set_write_cursor(&mut self, layer: usize, slot: u32) {
        self.write_cursor[layer] = slot;
    }

    /// Size of the encoded record in bytes.
    pub fn encoded_len(&self) -> usize {
        8 + 8 * self.layer_count()
    }

    /// Writes the record using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.id.to_le_bytes())?;
        writer.write_all(&(self.layer_count() as u32).to_le_bytes())?;
        for cursor in &self.write_cursor {
            writer.write_all(&cursor.to_le_bytes())?;
        }
        for interval in &self.intervals {
            writer.write_all(&interval.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a record using little-endian byte order.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::InvalidMetadata` for a truncated record, a layer
    /// count outside `1..=4` or invalid intervals.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let id = read_u32(reader)?;
        let layer_count = read_u32(reader)? as usize;
        if layer_count == 0 || layer_count > MAX_LAYERS {
            return Err(FeedError::InvalidMetadata(format!(
                "feed {} layer count {} out of range",
                id, layer_count
            )));
        }

        let mut write_cursor = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            write_cursor.push(read_u32(reader)?);
        }
        let mut intervals = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            intervals.push(read_u32(reader)?);
        }

        Self::with_cursors(id, intervals, write_cursor)
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FeedError::InvalidMetadata("truncated metadata record".to_string())
        } else {
            FeedError::Io(e)
        }
    })?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads and writes feed metadata files under `<data_dir>/<id>/<id>.meta`.
#[derive(Debug, Clone)]
pub struct MetaStore {
    data_dir: PathBuf,
}

impl MetaStore {
    /// Creates a metadata store rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the directory holding all files of a feed.
    pub fn feed_dir(&self, id: FeedId) -> PathBuf {
        self.data_dir.join(id.to_string())
    }

    /// Returns the metadata file path of a feed.
    pub fn meta_path(&self, id: FeedId) -> PathBuf {
        self.feed_dir(id)
            .join(format!("{}.{}", id, META_EXTENSION))
    }

    /// Returns true if the feed has a metadata file.
    pub fn exists(&self, id: FeedId) -> bool {
        self.meta_path(id).is_file()
    }

    /// Loads the metadata of a feed.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::NotFound` if the file is absent or its layer count
    /// decodes outside `1..=4`.
    pub fn get_meta(&self, id: FeedId) -> Result<FeedMetadata> {
        let path = self.meta_path(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FeedError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        };

        match FeedMetadata::read_from(&mut BufReader::new(file)) {
            Ok(meta) => Ok(meta),
            Err(FeedError::InvalidMetadata(reason)) => {
                warn!("Feed {} metadata rejected: {}", id, reason);
                Err(FeedError::NotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Persists the metadata of a feed, creating the feed directory if absent.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::Locked` if another writer holds the metadata file.
    pub fn create_meta(&self, meta: &FeedMetadata) -> Result<()> {
        let feed_dir = self.feed_dir(meta.id());
        if !feed_dir.exists() {
            info!("Creating feed directory {}", feed_dir.display());
            fs::create_dir_all(&feed_dir)?;
        }

        let path = self.meta_path(meta.id());
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        lock_exclusive(&file, &path)?;

        let mut buf = Vec::with_capacity(meta.encoded_len());
        meta.write_to(&mut buf)?;
        file.set_len(0)?;
        file.write_all(&buf)?;
        debug!("Wrote metadata for feed {}", meta.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_layer_ladder() {
        assert_eq!(layer_ladder(10).unwrap(), vec![10, 60, 600, 3600]);
        assert_eq!(layer_ladder(120).unwrap(), vec![120, 600, 3600]);
        assert_eq!(layer_ladder(1800).unwrap(), vec![1800, 3600]);
        assert_eq!(layer_ladder(3600).unwrap(), vec![3600]);
        assert!(layer_ladder(7).is_none());
        assert!(layer_ladder(7200).is_none());
    }

    #[test]
    fn test_record_layout() {
        let meta = FeedMetadata::new(7, vec![60, 3600]).unwrap();
        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();

        assert_eq!(buf.len(), meta.encoded_len());
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..8], &2u32.to_le_bytes());
        assert_eq!(&buf[16..20], &60u32.to_le_bytes());
        assert_eq!(&buf[20..24], &3600u32.to_le_bytes());
    }

    #[test]
    fn test_record_roundtrip_with_cursor() {
        let mut meta = FeedMetadata::new(7, vec![60, 3600]).unwrap();
        meta.set_write_cursor(1, 42);

        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        let read = FeedMetadata::read_from(&mut Cursor::new(buf)).unwrap();

        assert_eq!(read, meta);
        assert_eq!(read.write_cursor(1), 42);
    }

    #[test]
    fn test_invalid_layer_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&5u32.to_le_bytes());
        let result = FeedMetadata::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(FeedError::InvalidMetadata(_))));
    }

    #[test]
    fn test_non_increasing_intervals_rejected() {
        assert!(FeedMetadata::new(1, vec![600, 60]).is_err());
        assert!(FeedMetadata::new(1, vec![]).is_err());
    }

    #[test]
    fn test_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetaStore::new(temp_dir.path());

        let meta = FeedMetadata::new(7, vec![60, 3600]).unwrap();
        store.create_meta(&meta).unwrap();

        assert!(store.exists(7));
        assert_eq!(store.get_meta(7).unwrap(), meta);
    }

    #[test]
    fn test_store_missing_feed() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetaStore::new(temp_dir.path());
        assert!(matches!(store.get_meta(3), Err(FeedError::NotFound(3))));
    }

    #[test]
    fn test_store_corrupt_layer_count_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetaStore::new(temp_dir.path());
        fs::create_dir_all(store.feed_dir(9)).unwrap();

        let mut buf = Vec::new();
        buf.extend_from_slice(&9u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        fs::write(store.meta_path(9), buf).unwrap();

        assert!(matches!(store.get_meta(9), Err(FeedError::NotFound(9))));
    }

    #[test]
    fn test_store_rewrite_shrinks_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetaStore::new(temp_dir.path());

        let four = FeedMetadata::new(5, vec![10, 60, 600, 3600]).unwrap();
        store.create_meta(&four).unwrap();
        let one = FeedMetadata::new(5, vec![3600]).unwrap();
        store.create_meta(&one).unwrap();

        let len = fs::metadata(store.meta_path(5)).unwrap().len();
        assert_eq!(len as usize, one.encoded_len());
        assert_eq!(store.get_meta(5).unwrap(), one);
    }

    #[test]
    fn test_store_locked_meta_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetaStore::new(temp_dir.path());

        let original = FeedMetadata::new(7, vec![60, 3600]).unwrap();
        store.create_meta(&original).unwrap();

        let held = File::open(store.meta_path(7)).unwrap();
        held.try_lock().unwrap();

        let mut changed = original.clone();
        changed.set_write_cursor(0, 99);
        assert!(matches!(
            store.create_meta(&changed),
            Err(FeedError::Locked { .. })
        ));
        assert_eq!(store.get_meta(7).unwrap(), original);

        drop(held);
        store.create_meta(&changed).unwrap();
        assert_eq!(store.get_meta(7).unwrap().write_cursor(0), 99);
    }
}
