//! Range resampler and the other read paths of the file backend.
//!
//! A read picks the coarsest layer whose interval fits inside the requested
//! output interval, then walks the output buckets `t0 = start + k × interval`
//! for every `t0 ≤ end`. Each bucket averages the non-NaN stored slots whose
//! time lies in `[t0, t0 + interval)`. Partition windows are loaded lazily,
//! one partition at a time, bounded by the partition's point count.

use crate::csv::TimeFormatter;
use crate::error::{FeedError, Result};
use crate::fiwa::meta::FeedMetadata;
use crate::fiwa::partition::{
    partition_id, partition_start, slot_time, PartitionStore, HEADER_SIZE, SLOT_SIZE,
};
use crate::types::{DataPoint, DataQuery, WEEK_NPOINTS};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone};
use std::io::Write;
use tracing::debug;

/// Seconds in a day.
const DAY_SECS: u32 = 86_400;

/// Seconds in a week.
const WEEK_SECS: u32 = 604_800;

/// Upper bound on the result buffer reserved up front.
const PREALLOC_POINTS: u64 = 8_928;

/// Aggregation period of [`FiwaEngine::get_data_dmy`](crate::fiwa::FiwaEngine::get_data_dmy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmyMode {
    /// One point per local day.
    Daily,
    /// One point per local week, weeks starting on Monday.
    Weekly,
    /// One point per local calendar month.
    Monthly,
}

/// Slots of one partition overlapping the requested range.
#[derive(Debug)]
struct PartitionWindow {
    partition_id: i64,
    first_slot: u32,
    values: Vec<f32>,
    /// Time just past the last loaded slot.
    data_end: i64,
}

impl PartitionWindow {
    fn value(&self, slot: u32) -> Option<f32> {
        let index = slot.checked_sub(self.first_slot)? as usize;
        self.values.get(index).copied().filter(|v| !v.is_nan())
    }
}

/// Reads partitions of one feed.
pub(crate) struct RangeResampler<'a> {
    partitions: &'a PartitionStore,
    max_datapoints: Option<usize>,
}

impl<'a> RangeResampler<'a> {
    pub(crate) fn new(partitions: &'a PartitionStore, max_datapoints: Option<usize>) -> Self {
        Self {
            partitions,
            max_datapoints,
        }
    }

    /// Resamples `query` from the best-fitting layer.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::InvalidRange` for an inverted range and
    /// `FeedError::CapacityExceeded` if the bucket count is above the cap.
    pub(crate) fn get_data(&self, meta: &FeedMetadata, query: &DataQuery) -> Result<Vec<DataPoint>> {
        let (start, end) = query.range_secs()?;
        let out = i64::from(query.interval.max(meta.interval(0)));
        let layer = meta
            .intervals()
            .iter()
            .rposition(|iv| i64::from(*iv) <= out)
            .unwrap_or(0);
        let interval = i64::from(meta.interval(layer));

        let requested = ((end - start) / out + 1) as u64;
        if let Some(limit) = self.max_datapoints {
            if requested > limit as u64 {
                return Err(FeedError::CapacityExceeded {
                    requested,
                    limit: limit as u64,
                });
            }
        }
        debug!(
            "Feed {}: reading {} buckets of {}s from layer {} ({}s)",
            meta.id(),
            requested,
            out,
            layer,
            interval
        );

        let range = (start, end + out);
        let mut window: Option<PartitionWindow> = None;
        let mut data = Vec::with_capacity(requested.min(PREALLOC_POINTS) as usize);
        let mut k = 0i64;
        loop {
            let t0 = start + k * out;
            if t0 > end {
                break;
            }
            let t1 = t0 + out;

            let mut sum = 0.0f64;
            let mut count = 0u32;
            let mut ts = ceil_to(t0, interval);
            while ts < t1 {
                let pid = partition_id(ts, interval);
                if window.as_ref().map(|w| w.partition_id) != Some(pid) {
                    window = Some(self.load_window(meta, layer, pid, range)?);
                }
                let slot = 1 + ((ts - partition_start(pid)) / interval) as u32;
                if let Some(value) = window.as_ref().and_then(|w| w.value(slot)) {
                    sum += f64::from(value);
                    count += 1;
                }
                ts += interval;
            }

            if count > 0 {
                data.push(DataPoint::some(t0 * 1000, sum / f64::from(count)));
            } else if !query.skip_missing {
                data.push(DataPoint::new(t0 * 1000, None));
            }

            k += 1;
            if count == 0 && query.skip_missing {
                if let Some(w) = window.as_ref().filter(|w| w.data_end <= t1) {
                    let partition_end = partition_start(w.partition_id) + WEEK_NPOINTS * interval;
                    if partition_end > t1 {
                        k = k.max(ceil_div(partition_end - start, out));
                    }
                }
            }
        }
        Ok(data)
    }

    fn load_window(
        &self,
        meta: &FeedMetadata,
        layer: usize,
        pid: i64,
        (lo, hi): (i64, i64),
    ) -> Result<PartitionWindow> {
        let interval = i64::from(meta.interval(layer));
        let empty = PartitionWindow {
            partition_id: pid,
            first_slot: 1,
            values: Vec::new(),
            data_end: i64::MIN,
        };
        let reader = match self.partitions.open_read(meta.id(), layer, pid)? {
            Some(reader) => reader,
            None => return Ok(empty),
        };

        let pstart = partition_start(pid);
        let first_slot = 1 + ceil_div((lo - pstart).max(0), interval);
        let last_slot = (1 + (hi - pstart - 1).div_euclid(interval))
            .min(WEEK_NPOINTS)
            .min(i64::from(reader.point_count()));
        if last_slot < first_slot {
            return Ok(empty);
        }

        let values = reader.read_slots(first_slot as u32, (last_slot - first_slot + 1) as u64)?;
        let data_end = pstart + (first_slot - 1 + values.len() as i64) * interval;
        Ok(PartitionWindow {
            partition_id: pid,
            first_slot: first_slot as u32,
            values,
            data_end,
        })
    }

    /// Returns the most recent layer-0 sample, time in unix seconds.
    pub(crate) fn lastvalue(&self, meta: &FeedMetadata) -> Result<Option<DataPoint>> {
        let ids = self.partitions.partition_ids(meta.id(), 0)?;
        for pid in ids.into_iter().rev() {
            let reader = match self.partitions.open_read(meta.id(), 0, pid)? {
                Some(reader) if reader.point_count() > 0 => reader,
                _ => continue,
            };
            let count = reader.point_count();
            if let Some(value) = reader.read_slots(count, 1)?.first() {
                let time = slot_time(pid, count, meta.interval(0));
                let value = (!value.is_nan()).then_some(f64::from(*value));
                return Ok(Some(DataPoint::new(time, value)));
            }
        }
        Ok(None)
    }

    /// Streams the slot payload of every partition of `layer` into `out`.
    pub(crate) fn export_layer(
        &self,
        meta: &FeedMetadata,
        layer: usize,
        byte_offset: u64,
        out: &mut dyn Write,
    ) -> Result<u64> {
        if layer >= meta.layer_count() {
            return Err(FeedError::InvalidMetadata(format!(
                "feed {} has no layer {}",
                meta.id(),
                layer
            )));
        }

        let mut written = 0u64;
        let mut from = (byte_offset / SLOT_SIZE * SLOT_SIZE).max(HEADER_SIZE);
        for pid in self.partitions.partition_ids(meta.id(), layer)? {
            if let Some(reader) = self.partitions.open_read(meta.id(), layer, pid)? {
                let to = HEADER_SIZE + u64::from(reader.point_count()) * SLOT_SIZE;
                written += reader.copy_range(from, to, out)?;
            }
            from = HEADER_SIZE;
        }
        debug!(
            "Feed {}: exported {} bytes of layer {}",
            meta.id(),
            written,
            layer
        );
        Ok(written)
    }

    /// Averages per local day, week or month.
    pub(crate) fn get_data_dmy(
        &self,
        meta: &FeedMetadata,
        query: &DataQuery,
        mode: DmyMode,
        formatter: &dyn TimeFormatter,
        timezone: &str,
    ) -> Result<Vec<DataPoint>> {
        let (start, end) = query.range_secs()?;
        let offset = formatter.utc_offset(timezone, start);
        let invalid = || FeedError::InvalidRange { start, end };

        let local = DateTime::from_timestamp(start, 0)
            .ok_or_else(invalid)?
            .with_timezone(&offset);
        let day = local.date_naive();
        let first_day = match mode {
            DmyMode::Daily => day,
            DmyMode::Weekly => day - Duration::days(i64::from(day.weekday().num_days_from_monday())),
            DmyMode::Monthly => day.with_day(1).ok_or_else(invalid)?,
        };
        let aligned = local_midnight(first_day, &offset).ok_or_else(invalid)?;

        let bucket = match mode {
            DmyMode::Weekly => WEEK_SECS,
            DmyMode::Daily | DmyMode::Monthly => DAY_SECS,
        };
        let daily_query = DataQuery {
            start_ms: aligned * 1000,
            end_ms: query.end_ms,
            interval: bucket,
            skip_missing: query.skip_missing || mode == DmyMode::Monthly,
            limit_interval: query.limit_interval,
        };
        let series = self.get_data(meta, &daily_query)?;
        if mode != DmyMode::Monthly {
            return Ok(series);
        }

        let mut months = Vec::new();
        let mut month = first_day;
        let mut points = series.iter().peekable();
        while let Some(month_start) = local_midnight(month, &offset).filter(|t| *t <= end) {
            let next = next_month(month).ok_or_else(invalid)?;
            let month_end = local_midnight(next, &offset).ok_or_else(invalid)?;

            let mut sum = 0.0;
            let mut count = 0u32;
            while let Some(point) = points.next_if(|p| p.time < month_end * 1000) {
                if let Some(value) = point.value {
                    sum += value;
                    count += 1;
                }
            }
            if count > 0 {
                months.push(DataPoint::some(month_start * 1000, sum / f64::from(count)));
            } else if !query.skip_missing {
                months.push(DataPoint::new(month_start * 1000, None));
            }
            month = next;
        }
        Ok(months)
    }
}

fn local_midnight(day: NaiveDate, offset: &FixedOffset) -> Option<i64> {
    let naive = day.and_hms_opt(0, 0, 0)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}

fn next_month(day: NaiveDate) -> Option<NaiveDate> {
    if day.month() == 12 {
        NaiveDate::from_ymd_opt(day.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(day.year(), day.month() + 1, 1)
    }
}

fn ceil_div(value: i64, divisor: i64) -> i64 {
    -((-value).div_euclid(divisor))
}

fn ceil_to(value: i64, step: i64) -> i64 {
    ceil_div(value, step) * step
}
