//! Series store
//!
//! Datapoints partitioned by metric, then by granularity:
//!
//! ```text
//! SeriesStore
//!   └─ metric id → Mutex<MetricSeries>
//!        ├─ raw:      timestamp → value        (highest granularity)
//!        └─ derived:  granularity → { watermark, bucket start → Bucket }
//! ```
//!
//! The outer map lock is only held to look up or create a partition, so
//! writers to different metrics never wait on each other.

use crate::clock::Clock;
use crate::storage::downsampler::{closed_limit, rollup, Aggregate, Bucket, Downsampler};
use crate::storage::error::{StreamError, StreamResult};
use crate::storage::types::{DataValue, Datapoint, Granularity, MetricId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One coarser-granularity series of a metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedTier {
    /// Exclusive end of the last sealed bucket
    pub watermark: Option<i64>,
    pub buckets: BTreeMap<i64, Bucket>,
}

/// All stored data of a single metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    highest: Granularity,
    raw: BTreeMap<i64, f64>,
    derived: BTreeMap<Granularity, DerivedTier>,
}

impl MetricSeries {
    pub fn new(highest: Granularity) -> Self {
        Self {
            highest,
            raw: BTreeMap::new(),
            derived: highest
                .coarser_levels()
                .map(|g| (g, DerivedTier::default()))
                .collect(),
        }
    }

    /// Everything before this timestamp has been rolled into a coarser tier
    pub fn sealed_until(&self) -> Option<i64> {
        self.highest
            .coarser()
            .and_then(|g| self.derived.get(&g))
            .and_then(|tier| tier.watermark)
    }

    /// Store a value at the highest granularity (last write wins)
    pub fn insert(&mut self, timestamp: i64, value: f64) -> StreamResult<()> {
        if let Some(sealed_until) = self.sealed_until() {
            if timestamp < sealed_until {
                return Err(StreamError::InvalidTimestamp {
                    timestamp,
                    sealed_until,
                });
            }
        }

        self.raw.insert(timestamp, value);
        Ok(())
    }

    /// Store a value at `now`, moved forward to the first unsealed timestamp
    ///
    /// Returns the timestamp actually used.
    pub fn insert_latest(&mut self, now: i64, value: f64) -> i64 {
        let timestamp = match self.sealed_until() {
            Some(sealed_until) => now.max(sealed_until),
            None => now,
        };
        self.raw.insert(timestamp, value);
        timestamp
    }

    /// Points with `start <= t <= end`, ascending
    pub fn range(&self, granularity: Granularity, start: i64, end: i64) -> StreamResult<Vec<Datapoint>> {
        if granularity < self.highest {
            return Err(StreamError::UnsupportedGranularity(format!(
                "{} is finer than the stored {}",
                granularity, self.highest
            )));
        }

        if start > end {
            return Ok(Vec::new());
        }

        if granularity == self.highest {
            return Ok(self
                .raw
                .range(start..=end)
                .map(|(&t, &v)| Datapoint::raw(t, v))
                .collect());
        }

        Ok(self
            .derived
            .get(&granularity)
            .map(|tier| {
                tier.buckets
                    .range(start..=end)
                    .map(|(&t, bucket)| Datapoint {
                        t,
                        v: DataValue::Downsampled(bucket.values.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Roll every closed bucket not yet sealed, finest tier first
    ///
    /// Returns the number of buckets written.
    pub fn downsample(&mut self, now: i64, functions: &[Arc<dyn Downsampler>]) -> usize {
        let mut written = 0;
        let mut finer_sealed = now;
        let mut finer = self.highest;

        for granularity in self.highest.coarser_levels() {
            let tier = self.derived.get(&granularity);
            let from = tier.and_then(|t| t.watermark).unwrap_or(i64::MIN);
            let limit = closed_limit(granularity, now, finer_sealed);

            if limit > from {
                let source: Vec<(i64, Aggregate)> = if finer == self.highest {
                    self.raw
                        .range(from..limit)
                        .map(|(&t, &v)| (t, Aggregate::of(v)))
                        .collect()
                } else {
                    self.derived
                        .get(&finer)
                        .map(|tier| {
                            tier.buckets
                                .range(from..limit)
                                .map(|(&t, b)| (t, b.state))
                                .collect()
                        })
                        .unwrap_or_default()
                };

                let buckets = rollup(granularity, source, functions);
                written += buckets.len();

                let tier = self.derived.entry(granularity).or_default();
                tier.buckets.extend(buckets);
                tier.watermark = Some(limit);
            }

            match self.derived.get(&granularity).and_then(|t| t.watermark) {
                Some(watermark) => finer_sealed = watermark,
                // Nothing sealed at this level, so nothing coarser can close
                None => break,
            }
            finer = granularity;
        }

        written
    }

    /// Drop all derived data so the next downsample recomputes from scratch
    pub fn clear_derived(&mut self) {
        for tier in self.derived.values_mut() {
            *tier = DerivedTier::default();
        }
    }

    /// Stored point count per granularity
    pub fn point_counts(&self) -> BTreeMap<Granularity, usize> {
        let mut counts = BTreeMap::new();
        counts.insert(self.highest, self.raw.len());
        for (granularity, tier) in &self.derived {
            counts.insert(*granularity, tier.buckets.len());
        }
        counts
    }
}

/// Per-metric datapoint partitions
#[derive(Debug, Default)]
pub struct SeriesStore {
    partitions: RwLock<HashMap<MetricId, Arc<Mutex<MetricSeries>>>>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted partitions
    pub fn from_snapshot(snapshot: HashMap<MetricId, MetricSeries>) -> Self {
        Self {
            partitions: RwLock::new(
                snapshot
                    .into_iter()
                    .map(|(id, series)| (id, Arc::new(Mutex::new(series))))
                    .collect(),
            ),
        }
    }

    /// Create an empty partition unless one exists
    pub async fn create(&self, id: MetricId, highest: Granularity) {
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(MetricSeries::new(highest))));
    }

    pub async fn partition(&self, id: &MetricId) -> StreamResult<Arc<Mutex<MetricSeries>>> {
        let partitions = self.partitions.read().await;
        partitions
            .get(id)
            .cloned()
            .ok_or(StreamError::UnknownMetric(*id))
    }

    pub async fn insert(&self, id: &MetricId, timestamp: i64, value: f64) -> StreamResult<()> {
        let partition = self.partition(id).await?;
        let mut series = partition.lock().await;
        series.insert(timestamp, value)
    }

    /// Insert at the clock's current time
    ///
    /// The clock is read under the partition lock, so a downsample that
    /// finishes first can never leave the timestamp inside a sealed bucket.
    pub async fn insert_now(&self, id: &MetricId, clock: &dyn Clock, value: f64) -> StreamResult<i64> {
        let partition = self.partition(id).await?;
        let mut series = partition.lock().await;
        Ok(series.insert_latest(clock.now_millis(), value))
    }

    pub async fn range(
        &self,
        id: &MetricId,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> StreamResult<Vec<Datapoint>> {
        let partition = self.partition(id).await?;
        let series = partition.lock().await;
        series.range(granularity, start, end)
    }

    /// Copy of every partition, for persistence
    pub async fn snapshot(&self) -> HashMap<MetricId, MetricSeries> {
        let handles: Vec<(MetricId, Arc<Mutex<MetricSeries>>)> = {
            let partitions = self.partitions.read().await;
            partitions
                .iter()
                .map(|(id, p)| (*id, Arc::clone(p)))
                .collect()
        };

        let mut snapshot = HashMap::with_capacity(handles.len());
        for (id, partition) in handles {
            snapshot.insert(id, partition.lock().await.clone());
        }
        snapshot
    }

    /// Total stored point count per granularity
    pub async fn point_counts(&self) -> BTreeMap<Granularity, usize> {
        let mut totals = BTreeMap::new();
        for series in self.snapshot().await.values() {
            for (granularity, count) in series.point_counts() {
                *totals.entry(granularity).or_insert(0) += count;
            }
        }
        totals
    }
}
