//! Cascading averaging writer.
//!
//! A post writes the raw value into layer 0, then walks up the pyramid: each
//! coarser layer receives the average of the finer-layer slots that fall into
//! its bucket. Each partition write is durable on its own; a failure between
//! layers leaves the coarser layers stale until the next write reaches them.

use crate::error::Result;
use crate::fiwa::meta::{FeedMetadata, MetaStore};
use crate::fiwa::partition::{PartitionPosition, PartitionStore};
use tracing::{debug, warn};

/// Averages the non-NaN values, or returns NaN if there are none.
pub fn rollup_average(values: &[f32]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0u32), |(sum, count), v| (sum + f64::from(*v), count + 1));
    if count > 0 {
        sum / f64::from(count)
    } else {
        f64::NAN
    }
}

/// Value travelling up the pyramid.
#[derive(Debug, Clone, Copy)]
struct RollupState {
    layer: usize,
    time: i64,
    value: f64,
}

/// Writes points into every layer of a feed.
pub(crate) struct CascadingWriter<'a> {
    meta_store: &'a MetaStore,
    partitions: &'a PartitionStore,
}

impl<'a> CascadingWriter<'a> {
    pub(crate) fn new(meta_store: &'a MetaStore, partitions: &'a PartitionStore) -> Self {
        Self {
            meta_store,
            partitions,
        }
    }

    /// Writes `value` at `time` into layer 0 and rolls it up through the
    /// coarser layers. `meta` is updated and persisted whenever a layer's
    /// write frontier advances.
    pub(crate) fn post(&self, meta: &mut FeedMetadata, time: i64, value: f64) -> Result<()> {
        let mut state = RollupState {
            layer: 0,
            time,
            value,
        };

        loop {
            let interval = meta.interval(state.layer);
            let pos = self.partitions.locate(state.time, interval);
            let mut partition =
                self.partitions
                    .open_or_create(meta.id(), state.layer, pos.partition_id)?;

            let last = partition.read_point_count()?;
            let padding = i64::from(pos.slot) - i64::from(last) - 1;
            if let Err(e) = partition.pad_gap(last, padding) {
                warn!(
                    "Feed {} layer {}: padding of {} slots rejected: {}",
                    meta.id(),
                    state.layer,
                    padding,
                    e
                );
                return Err(e);
            }

            partition.write_point(pos.slot, state.value)?;
            if pos.slot > last {
                partition.update_point_count(pos.slot)?;
                meta.set_write_cursor(state.layer, pos.slot);
                self.meta_store.create_meta(meta)?;
            }
            debug!(
                "Feed {} layer {}: wrote slot {} of partition {}",
                meta.id(),
                state.layer,
                pos.slot,
                pos.partition_id
            );

            let next = state.layer + 1;
            if next >= meta.layer_count() {
                return Ok(());
            }

            let coarse = PartitionPosition::locate(
                pos.time,
                meta.interval(next),
                self.partitions.rounding(),
            );
            let span = (pos.time - coarse.time) / i64::from(interval);
            let first_slot = (i64::from(pos.slot) - span).max(1) as u32;
            let values = partition.read_slots(first_slot, (span + 1) as u64)?;
            drop(partition);

            state = RollupState {
                layer: next,
                time: coarse.time,
                value: rollup_average(&values),
            };
        }
    }
}
