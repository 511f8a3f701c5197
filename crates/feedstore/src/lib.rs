//! Feedstore - pluggable time-series feed storage
//!
//! This crate persists timestamped scalar samples per numeric feed id and
//! serves range queries at arbitrary output resolution.
//!
//! # Components
//!
//! - [`FeedEngine`]: the storage contract shared by every backend
//! - [`FiwaEngine`]: partitioned flat files with a cascading averaging pyramid
//! - [`KvEngine`]: raw samples in a key-value store with nearest-point reads
//!   and batched writes
//! - [`TimeFormatter`]: the time formatting collaborator used by CSV export
//!
//! # Example
//!
//! ```rust
//! use feedstore::fiwa::{FiwaConfig, FiwaEngine};
//! use feedstore::{current_unix_time, CreateOptions, DataQuery, FeedEngine};
//! use tempfile::TempDir;
//!
//! let temp_dir = TempDir::new().unwrap();
//! let mut engine = FiwaEngine::new(FiwaConfig::new(temp_dir.path()));
//! engine.create(7, &CreateOptions::new(10)).unwrap();
//!
//! let start = current_unix_time() / 3600 * 3600 - 3600;
//! for i in 0..6 {
//!     engine.post(7, start + 10 * i, i as f64).unwrap();
//! }
//!
//! // one point per hour, read from the 3600s layer
//! let query = DataQuery::new(start * 1000, start * 1000, 3600);
//! let data = engine.get_data(7, &query).unwrap();
//! assert_eq!(data[0].value, Some(2.5));
//! ```

#![deny(missing_docs)]

pub mod csv;
pub mod engine;
pub mod error;
pub mod fiwa;
pub mod kv;
pub mod types;

pub use csv::{CsvOptions, CsvRequest, FixedOffsetFormatter, TimeFormatter};
pub use engine::FeedEngine;
pub use error::{FeedError, Result};
pub use fiwa::{FiwaConfig, FiwaEngine};
pub use kv::{KvClient, KvConfig, KvEngine, KvError, MemoryKvStore};
pub use types::{current_unix_time, CreateOptions, DataPoint, DataQuery, FeedId, WEEK_NPOINTS};
