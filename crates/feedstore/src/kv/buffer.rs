//! In-memory write buffer of the key-value backend.
//!
//! ```text
//! feed 3 → [ [25 items], [25 items], [13 items] ]
//! feed 9 → [ [4 items] ]
//! ```
//!
//! Each inner list is sent as one batch write. The buffer lives only in the
//! process; unflushed items are lost on exit.

use crate::kv::client::{LastValueItem, SampleItem};
use crate::types::FeedId;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Last `(time, value)` seen per feed.
#[derive(Debug, Clone, Default)]
pub struct LastValueCache {
    entries: HashMap<FeedId, LastValueItem>,
}

impl LastValueCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached record of `feed`.
    pub fn get(&self, feed: FeedId) -> Option<LastValueItem> {
        self.entries.get(&feed).copied()
    }

    /// Replaces the record of `feed`.
    pub fn set(&mut self, feed: FeedId, time: i64, value: f64) {
        self.entries.insert(
            feed,
            LastValueItem {
                feed_id: feed,
                time,
                value,
            },
        );
    }

    /// Replaces the record of `feed` only if `time` is newer than the cached one.
    pub fn advance(&mut self, feed: FeedId, time: i64, value: f64) {
        if self.get(feed).is_none_or(|cached| time > cached.time) {
            self.set(feed, time, value);
        }
    }

    /// Forgets `feed`.
    pub fn remove(&mut self, feed: FeedId) {
        self.entries.remove(&feed);
    }
}

/// Per-feed lists of pending sample batches plus the last-value cache.
#[derive(Debug, Clone)]
pub struct WriteBuffer {
    batch_size: usize,
    feeds: BTreeMap<FeedId, VecDeque<Vec<SampleItem>>>,
    last_values: LastValueCache,
}

impl WriteBuffer {
    /// Creates an empty buffer producing batches of at most `batch_size` items.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            feeds: BTreeMap::new(),
            last_values: LastValueCache::new(),
        }
    }

    /// Appends `item` to the feed's current batch, opening a new batch once
    /// the current one is full.
    pub fn push(&mut self, feed: FeedId, item: SampleItem) {
        let batches = self.feeds.entry(feed).or_default();
        match batches.back_mut() {
            Some(batch) if batch.len() < self.batch_size => batch.push(item),
            _ => {
                let mut batch = Vec::with_capacity(self.batch_size);
                batch.push(item);
                batches.push_back(batch);
            }
        }
    }

    /// Takes the oldest batch of the lowest buffered feed id.
    pub fn pop_batch(&mut self) -> Option<(FeedId, Vec<SampleItem>)> {
        let mut entry = self.feeds.first_entry()?;
        let feed = *entry.key();
        let batch = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        batch.map(|batch| (feed, batch))
    }

    /// Puts a batch back at the front of the feed's queue.
    pub fn restore_batch(&mut self, feed: FeedId, batch: Vec<SampleItem>) {
        if !batch.is_empty() {
            self.feeds.entry(feed).or_default().push_front(batch);
        }
    }

    /// Drops everything buffered for `feed`, including its cached last value.
    pub fn discard(&mut self, feed: FeedId) {
        self.feeds.remove(&feed);
        self.last_values.remove(feed);
    }

    /// Number of pending batches of `feed`.
    pub fn batch_count(&self, feed: FeedId) -> usize {
        self.feeds.get(&feed).map_or(0, VecDeque::len)
    }

    /// Number of pending items over all feeds.
    pub fn pending_items(&self) -> usize {
        self.feeds
            .values()
            .flat_map(|batches| batches.iter())
            .map(Vec::len)
            .sum()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Last-value cache.
    pub fn last_values(&self) -> &LastValueCache {
        &self.last_values
    }

    /// Mutable last-value cache.
    pub fn last_values_mut(&mut self) -> &mut LastValueCache {
        &mut self.last_values
    }
}
