//! Datastream Storage Engine
//!
//! This module provides the reference time-series backend:
//!
//! - **types**: Core data structures (MetricId, Tags, Granularity, Datapoint)
//! - **series**: Per-metric, per-granularity datapoint storage
//! - **downsampler**: Named aggregation functions and granularity rollups
//! - **engine**: Storage engine orchestrating all components
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   insert → metric partition → highest granularity tier
//!
//! Rollup Path:
//!   downsample_metrics → TagIndex match → closed buckets → coarser tiers
//!
//! Read Path:
//!   get_data → metric partition → tier range
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use datastream::storage::{tags, Granularity, StreamEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StreamEngine::in_memory();
//!
//!     let id = engine
//!         .ensure_metric(
//!             &tags([("host", "a")]),
//!             &tags([("env", "prod")]),
//!             &["mean".to_string()],
//!             Granularity::Seconds,
//!         )
//!         .await?;
//!
//!     engine.insert(&id, 7.5).await?;
//!     engine.downsample_metrics(&tags([("host", "a")])).await?;
//!
//!     let points = engine.get_data(&id, Granularity::Seconds, 0, i64::MAX).await?;
//!     println!("{} points", points.len());
//!
//!     Ok(())
//! }
//! ```

pub mod downsampler;
pub mod engine;
pub mod error;
pub mod series;
pub mod types;

// Re-export commonly used types
pub use downsampler::{Aggregate, Bucket, Downsampler, DownsamplerRegistry, FnDownsampler};
pub use engine::{EngineConfig, EngineStats, MetricRegistry, StreamEngine};
pub use error::{StreamError, StreamResult};
pub use series::{MetricSeries, SeriesStore};
pub use types::{tags, DataValue, Datapoint, Granularity, MetricDescriptor, MetricId, Tags};
