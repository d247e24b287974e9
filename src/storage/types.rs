//! Core data types for the datastream storage engine
//!
//! This module defines the fundamental types shared by the facade and backends:
//! - `MetricId`: Opaque, never reused metric identifier
//! - `Tags`: A tag-set (tag name → tag value)
//! - `Granularity`: Ordered time resolutions, finest first
//! - `Datapoint` and `DataValue`: Values returned by range queries
//! - `MetricDescriptor`: Everything known about one metric

use crate::storage::error::StreamError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A tag-set. Ordered so that a whole tag-set can be used as a map key.
pub type Tags = BTreeMap<String, String>;

/// Build a tag-set from string pairs
pub fn tags<K, V, I>(pairs: I) -> Tags
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Opaque metric identifier, assigned once at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(Uuid);

impl MetricId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MetricId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for MetricId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Time resolution at which datapoints are stored, finest first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[serde(alias = "second")]
    Seconds,
    #[serde(alias = "minute")]
    Minutes,
    #[serde(alias = "hour")]
    Hours,
    #[serde(alias = "day")]
    Days,
}

impl Granularity {
    /// All granularities, finest first
    pub fn all() -> &'static [Granularity] {
        &[
            Granularity::Seconds,
            Granularity::Minutes,
            Granularity::Hours,
            Granularity::Days,
        ]
    }

    /// Bucket width in milliseconds
    pub fn duration_millis(self) -> i64 {
        match self {
            Granularity::Seconds => 1_000,
            Granularity::Minutes => 60 * 1_000,
            Granularity::Hours => 3_600 * 1_000,
            Granularity::Days => 86_400 * 1_000,
        }
    }

    /// The next coarser granularity, if any
    pub fn coarser(self) -> Option<Granularity> {
        match self {
            Granularity::Seconds => Some(Granularity::Minutes),
            Granularity::Minutes => Some(Granularity::Hours),
            Granularity::Hours => Some(Granularity::Days),
            Granularity::Days => None,
        }
    }

    /// Every granularity strictly coarser than this one, finest first
    pub fn coarser_levels(self) -> impl Iterator<Item = Granularity> {
        Granularity::all().iter().copied().filter(move |g| *g > self)
    }

    /// Start of the epoch-aligned bucket containing `timestamp`
    pub fn bucket_start(self, timestamp: i64) -> i64 {
        let width = self.duration_millis();
        timestamp.div_euclid(width) * width
    }

    pub fn name(self) -> &'static str {
        match self {
            Granularity::Seconds => "seconds",
            Granularity::Minutes => "minutes",
            Granularity::Hours => "hours",
            Granularity::Days => "days",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Granularity {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" => Ok(Granularity::Seconds),
            "minutes" | "minute" => Ok(Granularity::Minutes),
            "hours" | "hour" => Ok(Granularity::Hours),
            "days" | "day" => Ok(Granularity::Days),
            _ => Err(StreamError::UnsupportedGranularity(s.to_string())),
        }
    }
}

/// Value of a datapoint
///
/// Points at a metric's highest granularity hold the inserted value. Points at
/// coarser granularities hold one value per configured downsampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Raw(f64),
    Downsampled(BTreeMap<String, f64>),
}

impl DataValue {
    /// The inserted value, for raw points
    pub fn as_raw(&self) -> Option<f64> {
        match self {
            DataValue::Raw(v) => Some(*v),
            DataValue::Downsampled(_) => None,
        }
    }

    /// A downsampled value by function name
    pub fn get(&self, downsampler: &str) -> Option<f64> {
        match self {
            DataValue::Raw(_) => None,
            DataValue::Downsampled(values) => values.get(downsampler).copied(),
        }
    }
}

/// A single (timestamp, value) pair returned by range queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Unix timestamp in milliseconds (bucket start for downsampled points)
    pub t: i64,
    pub v: DataValue,
}

impl Datapoint {
    pub fn raw(t: i64, value: f64) -> Self {
        Self {
            t,
            v: DataValue::Raw(value),
        }
    }
}

/// Everything known about one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub id: MetricId,
    /// Current full tag-set
    pub tags: Tags,
    /// Immutable identity subset fixed at creation
    pub query_tags: Tags,
    /// Downsampler function names, as given at creation
    pub downsamplers: Vec<String>,
    pub highest_granularity: Granularity,
}
