//! Downsampler engine
//!
//! Derives coarser-granularity points from finer ones.
//!
//! Every downsampler function is computed from a mergeable [`Aggregate`]
//! (count, sum, sum of squares, min, max, first, last). A raw point is an
//! aggregate of one value and a coarse bucket is the merge of the finer
//! aggregates it covers, so rolling hours into days gives exactly the values
//! a direct rollup of the raw points would.
//!
//! # Bucket policy
//!
//! ```text
//! bucket k at granularity G  = [k * width(G), (k + 1) * width(G))   (epoch aligned)
//! closed                     = bucket_end <= now
//!                              and bucket_end <= watermark of the finer tier
//! ```

use crate::storage::error::{StreamError, StreamResult};
use crate::storage::types::Granularity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Mergeable summary of a run of values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub sum_squares: f64,
    pub min: f64,
    pub max: f64,
    /// Earliest value in time order
    pub first: f64,
    /// Latest value in time order
    pub last: f64,
}

impl Aggregate {
    /// Aggregate of a single value
    pub fn of(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            sum_squares: value * value,
            min: value,
            max: value,
            first: value,
            last: value,
        }
    }

    /// Merge an aggregate covering a strictly later time span
    pub fn merge(&mut self, later: &Aggregate) {
        self.count += later.count;
        self.sum += later.sum;
        self.sum_squares += later.sum_squares;
        self.min = self.min.min(later.min);
        self.max = self.max.max(later.max);
        self.last = later.last;
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Population standard deviation
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        (self.sum_squares / self.count as f64 - mean * mean)
            .max(0.0)
            .sqrt()
    }
}

/// A named aggregation function
pub trait Downsampler: Send + Sync {
    fn name(&self) -> &str;

    /// Compute this function's value for one bucket
    fn finalize(&self, state: &Aggregate) -> f64;
}

/// Downsampler backed by a plain function pointer
pub struct FnDownsampler {
    name: String,
    func: fn(&Aggregate) -> f64,
}

impl FnDownsampler {
    pub fn new(name: impl Into<String>, func: fn(&Aggregate) -> f64) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl Downsampler for FnDownsampler {
    fn name(&self) -> &str {
        &self.name
    }

    fn finalize(&self, state: &Aggregate) -> f64 {
        (self.func)(state)
    }
}

/// Named downsampler functions available to metrics
pub struct DownsamplerRegistry {
    functions: HashMap<String, Arc<dyn Downsampler>>,
}

impl DownsamplerRegistry {
    /// Registry without any functions
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registry with the built-in functions
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_fn("mean", Aggregate::mean);
        registry.register_fn("sum", |a| a.sum);
        registry.register_fn("min", |a| a.min);
        registry.register_fn("max", |a| a.max);
        registry.register_fn("count", |a| a.count as f64);
        registry.register_fn("sum_squares", |a| a.sum_squares);
        registry.register_fn("std_dev", Aggregate::std_dev);
        registry.register_fn("first", |a| a.first);
        registry.register_fn("last", |a| a.last);
        registry
    }

    /// Add or replace a function
    pub fn register(&mut self, downsampler: Arc<dyn Downsampler>) {
        self.functions
            .insert(downsampler.name().to_string(), downsampler);
    }

    pub fn register_fn(&mut self, name: impl Into<String>, func: fn(&Aggregate) -> f64) {
        self.register(Arc::new(FnDownsampler::new(name, func)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Downsampler>> {
        self.functions.get(name).cloned()
    }

    /// Resolve a metric's configured names, failing on the first unknown one
    pub fn resolve(&self, names: &[String]) -> StreamResult<Vec<Arc<dyn Downsampler>>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| StreamError::UnsupportedDownsampler(name.clone()))
            })
            .collect()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for DownsamplerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for DownsamplerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownsamplerRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// One derived point: the merged state plus the configured function values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub state: Aggregate,
    pub values: BTreeMap<String, f64>,
}

impl Bucket {
    pub fn new(state: Aggregate, functions: &[Arc<dyn Downsampler>]) -> Self {
        let values = functions
            .iter()
            .map(|f| (f.name().to_string(), f.finalize(&state)))
            .collect();
        Self { state, values }
    }
}

/// Exclusive end of the closed buckets of `granularity`
///
/// `finer_sealed` is the watermark of the tier being rolled up; for the
/// metric's highest granularity it is simply `now`.
pub fn closed_limit(granularity: Granularity, now: i64, finer_sealed: i64) -> i64 {
    granularity.bucket_start(now.min(finer_sealed))
}

/// Fold finer points, ascending by timestamp, into buckets of `granularity`
pub fn rollup<I>(
    granularity: Granularity,
    points: I,
    functions: &[Arc<dyn Downsampler>],
) -> Vec<(i64, Bucket)>
where
    I: IntoIterator<Item = (i64, Aggregate)>,
{
    let mut buckets = Vec::new();
    let mut current: Option<(i64, Aggregate)> = None;

    for (timestamp, state) in points {
        let start = granularity.bucket_start(timestamp);

        if let Some((bucket_start, acc)) = current.as_mut() {
            if *bucket_start == start {
                acc.merge(&state);
                continue;
            }
        }

        if let Some((bucket_start, acc)) = current.take() {
            buckets.push((bucket_start, Bucket::new(acc, functions)));
        }
        current = Some((start, state));
    }

    if let Some((bucket_start, acc)) = current {
        buckets.push((bucket_start, Bucket::new(acc, functions)));
    }

    buckets
}
