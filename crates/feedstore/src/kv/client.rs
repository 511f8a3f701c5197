//! Key-value store client contract and the in-memory implementation.
//!
//! ## Table Layout
//!
//! ```text
//! feed_<id>      hash key week_index (N), range key time (N), attribute value (N)
//! last_values    hash key feed_id (N), attributes time (N), value (N)
//! ```
//!
//! `week_index = ceil(time / 604800)`, so one hash key holds one week of samples.

use crate::types::{FeedId, WEEK_NPOINTS};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Errors reported by a key-value store client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// The table does not exist.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// The table already exists.
    #[error("Table already exists: {0}")]
    TableExists(String),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Returns the hash key of the week holding `time`.
pub fn week_index(time: i64) -> i64 {
    -((-time).div_euclid(WEEK_NPOINTS))
}

/// One stored sample of a feed table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleItem {
    /// Hash key, see [`week_index`].
    pub week_index: i64,
    /// Range key, unix seconds.
    pub time: i64,
    /// Sample value.
    pub value: f64,
}

impl SampleItem {
    /// Creates an item, deriving the week index from `time`.
    pub fn new(time: i64, value: f64) -> Self {
        Self {
            week_index: week_index(time),
            time,
            value,
        }
    }
}

/// Durable last-value record of a feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastValueItem {
    /// Feed id, hash key of the `last_values` table.
    pub feed_id: FeedId,
    /// Unix seconds.
    pub time: i64,
    /// Sample value.
    pub value: f64,
}

/// Table provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Numeric hash key attribute.
    pub hash_key: String,
    /// Numeric range key attribute.
    pub range_key: String,
    /// Provisioned read capacity units.
    pub read_capacity: u64,
    /// Provisioned write capacity units.
    pub write_capacity: u64,
}

impl TableSchema {
    /// Schema of a feed table: `week_index` hash key, `time` range key.
    pub fn feed_table(name: impl Into<String>, read_capacity: u64, write_capacity: u64) -> Self {
        Self {
            name: name.into(),
            hash_key: "week_index".to_string(),
            range_key: "time".to_string(),
            read_capacity,
            write_capacity,
        }
    }
}

/// Result of a describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    /// Table name.
    pub name: String,
    /// Number of stored items.
    pub item_count: u64,
}

/// Range query within one hash key: `week_index = w AND time >= from_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowQuery {
    /// Hash key to read.
    pub week_index: i64,
    /// Inclusive lower bound on `time`.
    pub from_time: i64,
    /// Maximum number of items returned.
    pub limit: usize,
}

/// Operations the key-value backend issues against the store.
///
/// Reads take `&self`, writes take `&mut self`. Implementations decide how
/// they reach the store; the engine never retries a failed call, except
/// for items returned as unprocessed by [`batch_write_samples`](Self::batch_write_samples).
pub trait KvClient {
    /// Provisions a table.
    fn create_table(&mut self, schema: &TableSchema) -> Result<(), KvError>;

    /// Deletes a table and all of its items.
    fn delete_table(&mut self, name: &str) -> Result<(), KvError>;

    /// Describes a table.
    fn describe_table(&self, name: &str) -> Result<TableDescription, KvError>;

    /// Puts one sample, overwriting an item with the same key.
    fn put_sample(&mut self, table: &str, item: &SampleItem) -> Result<(), KvError>;

    /// Returns samples of one week in ascending time order.
    fn query_samples(&self, table: &str, query: &WindowQuery) -> Result<Vec<SampleItem>, KvError>;

    /// Writes a batch of samples. Returns the items the store did not process.
    fn batch_write_samples(
        &mut self,
        table: &str,
        items: &[SampleItem],
    ) -> Result<Vec<SampleItem>, KvError>;

    /// Puts the last-value record of a feed.
    fn put_last_value(&mut self, table: &str, item: &LastValueItem) -> Result<(), KvError>;

    /// Gets the last-value record of a feed.
    fn get_last_value(&self, table: &str, feed_id: FeedId)
        -> Result<Option<LastValueItem>, KvError>;

    /// Deletes the last-value record of a feed.
    fn delete_last_value(&mut self, table: &str, feed_id: FeedId) -> Result<(), KvError>;
}

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    items: BTreeMap<(i64, i64), f64>,
}

/// In-process [`KvClient`].
///
/// Feed tables must be created before use; last-value tables are created on
/// the first put. Batch throttling and outages can be injected for testing.
#[derive(Debug)]
pub struct MemoryKvStore {
    tables: BTreeMap<String, MemoryTable>,
    last_values: BTreeMap<String, BTreeMap<FeedId, LastValueItem>>,
    available: bool,
    throttle: VecDeque<usize>,
    batch_sizes: Vec<usize>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            last_values: BTreeMap::new(),
            available: true,
            throttle: VecDeque::new(),
            batch_sizes: Vec::new(),
        }
    }

    /// Makes the next batch write leave its last `count` items unprocessed.
    /// Calls queue up, one per batch write.
    pub fn throttle_next_batch(&mut self, count: usize) {
        self.throttle.push_back(count);
    }

    /// Switches the simulated outage off (`true`) or on (`false`).
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Sizes of all batch writes received so far.
    pub fn batch_sizes(&self) -> &[usize] {
        &self.batch_sizes
    }

    /// Number of items in `table`, or `None` if it does not exist.
    pub fn item_count(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|t| t.items.len())
    }

    /// Schema the table was created with.
    pub fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table).map(|t| &t.schema)
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available {
            Ok(())
        } else {
            Err(KvError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn table(&self, name: &str) -> Result<&MemoryTable, KvError> {
        self.tables
            .get(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable, KvError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))
    }
}

impl KvClient for MemoryKvStore {
    fn create_table(&mut self, schema: &TableSchema) -> Result<(), KvError> {
        self.check_available()?;
        if self.tables.contains_key(&schema.name) {
            return Err(KvError::TableExists(schema.name.clone()));
        }
        self.tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema: schema.clone(),
                items: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn delete_table(&mut self, name: &str) -> Result<(), KvError> {
        self.check_available()?;
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))
    }

    fn describe_table(&self, name: &str) -> Result<TableDescription, KvError> {
        self.check_available()?;
        let table = self.table(name)?;
        Ok(TableDescription {
            name: name.to_string(),
            item_count: table.items.len() as u64,
        })
    }

    fn put_sample(&mut self, table: &str, item: &SampleItem) -> Result<(), KvError> {
        self.check_available()?;
        self.table_mut(table)?
            .items
            .insert((item.week_index, item.time), item.value);
        Ok(())
    }

    fn query_samples(&self, table: &str, query: &WindowQuery) -> Result<Vec<SampleItem>, KvError> {
        self.check_available()?;
        let table = self.table(table)?;
        Ok(table
            .items
            .range((query.week_index, query.from_time)..=(query.week_index, i64::MAX))
            .take(query.limit)
            .map(|(&(week_index, time), &value)| SampleItem {
                week_index,
                time,
                value,
            })
            .collect())
    }

    fn batch_write_samples(
        &mut self,
        table: &str,
        items: &[SampleItem],
    ) -> Result<Vec<SampleItem>, KvError> {
        self.check_available()?;
        if !self.tables.contains_key(table) {
            return Err(KvError::TableNotFound(table.to_string()));
        }
        self.batch_sizes.push(items.len());

        let skipped = self.throttle.pop_front().unwrap_or(0).min(items.len());
        let (accepted, unprocessed) = items.split_at(items.len() - skipped);
        let target = self.table_mut(table)?;
        for item in accepted {
            target.items.insert((item.week_index, item.time), item.value);
        }
        Ok(unprocessed.to_vec())
    }

    fn put_last_value(&mut self, table: &str, item: &LastValueItem) -> Result<(), KvError> {
        self.check_available()?;
        self.last_values
            .entry(table.to_string())
            .or_default()
            .insert(item.feed_id, *item);
        Ok(())
    }

    fn get_last_value(
        &self,
        table: &str,
        feed_id: FeedId,
    ) -> Result<Option<LastValueItem>, KvError> {
        self.check_available()?;
        Ok(self
            .last_values
            .get(table)
            .and_then(|records| records.get(&feed_id))
            .copied())
    }

    fn delete_last_value(&mut self, table: &str, feed_id: FeedId) -> Result<(), KvError> {
        self.check_available()?;
        if let Some(records) = self.last_values.get_mut(table) {
            records.remove(&feed_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_table(name: &str) -> MemoryKvStore {
        let mut store = MemoryKvStore::new();
        store
            .create_table(&TableSchema::feed_table(name, 10, 10))
            .unwrap();
        store
    }

    #[test]
    fn test_week_index_is_ceiling() {
        assert_eq!(week_index(0), 0);
        assert_eq!(week_index(1), 1);
        assert_eq!(week_index(WEEK_NPOINTS), 1);
        assert_eq!(week_index(WEEK_NPOINTS + 1), 2);
        assert_eq!(SampleItem::new(WEEK_NPOINTS * 3, 1.0).week_index, 3);
    }

    #[test]
    fn test_create_twice_fails() {
        let mut store = store_with_table("feed_1");
        let result = store.create_table(&TableSchema::feed_table("feed_1", 10, 10));
        assert_eq!(result, Err(KvError::TableExists("feed_1".to_string())));
    }

    #[test]
    fn test_query_is_limited_to_one_week() {
        let mut store = store_with_table("feed_1");
        for time in [10, 20, 30, WEEK_NPOINTS + 5] {
            store.put_sample("feed_1", &SampleItem::new(time, 1.0)).unwrap();
        }

        let query = WindowQuery {
            week_index: 1,
            from_time: 15,
            limit: 10,
        };
        let times: Vec<i64> = store
            .query_samples("feed_1", &query)
            .unwrap()
            .iter()
            .map(|s| s.time)
            .collect();
        assert_eq!(times, vec![20, 30]);

        let limited = WindowQuery { limit: 1, ..query };
        assert_eq!(store.query_samples("feed_1", &limited).unwrap().len(), 1);
    }

    #[test]
    fn test_batch_throttle_returns_tail() {
        let mut store = store_with_table("feed_1");
        let items: Vec<SampleItem> = (1..=5).map(|t| SampleItem::new(t, t as f64)).collect();

        store.throttle_next_batch(2);
        let unprocessed = store.batch_write_samples("feed_1", &items).unwrap();
        assert_eq!(unprocessed, items[3..].to_vec());
        assert_eq!(store.item_count("feed_1"), Some(3));

        assert!(store
            .batch_write_samples("feed_1", &unprocessed)
            .unwrap()
            .is_empty());
        assert_eq!(store.item_count("feed_1"), Some(5));
        assert_eq!(store.batch_sizes(), &[5, 2]);
    }

    #[test]
    fn test_outage() {
        let mut store = store_with_table("feed_1");
        store.set_available(false);
        assert!(matches!(
            store.describe_table("feed_1"),
            Err(KvError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.describe_table("feed_1").unwrap().item_count, 0);
    }

    #[test]
    fn test_last_values() {
        let mut store = MemoryKvStore::new();
        assert_eq!(store.get_last_value("last_values", 1).unwrap(), None);

        let item = LastValueItem {
            feed_id: 1,
            time: 100,
            value: 2.5,
        };
        store.put_last_value("last_values", &item).unwrap();
        assert_eq!(store.get_last_value("last_values", 1).unwrap(), Some(item));

        store.delete_last_value("last_values", 1).unwrap();
        assert_eq!(store.get_last_value("last_values", 1).unwrap(), None);
    }
}
