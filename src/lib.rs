//! # Datastream
//!
//! Tagged time-series data stream: metric registry, multi-granularity
//! downsampling and range queries behind a pluggable backend facade.
//!
//! ## Features
//!
//! - **Metric identity by tags**: one metric per distinct query-tag set
//! - **Partial-match lookup**: find metrics by any subset of their tags
//! - **Downsampling**: closed buckets roll into minutes, hours and days
//!   using named, pluggable aggregation functions
//! - **Degraded mode**: without a configured backend every read is empty
//!   and every write is a no-op
//!
//! ## Modules
//!
//! - [`stream`]: The facade, backend trait and backend selection
//! - [`storage`]: Reference time-series backend
//! - [`index`]: Tag index
//! - [`config`]: Configuration loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datastream::{tags, Config, DataStream, Granularity};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Single initialization point
//!     let stream = DataStream::from_config(&Config::load_default()).await?;
//!
//!     let id = stream
//!         .ensure_metric(
//!             &tags([("host", "a")]),
//!             &tags([("env", "prod")]),
//!             &["mean".to_string(), "max".to_string()],
//!             Granularity::Minutes,
//!         )
//!         .await?;
//!
//!     if let Some(id) = id {
//!         stream.insert(&id, 5.0).await?;
//!         stream.downsample_metrics(&tags([("host", "a")])).await?;
//!         let hours = stream.get_data(&id, Granularity::Hours, 0, i64::MAX).await?;
//!         println!("{} hourly points", hours.len());
//!     }
//!
//!     stream.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod index;
pub mod storage;
pub mod stream;

// Re-export top-level types for convenience
pub use storage::{
    tags, DataValue, Datapoint, EngineConfig, EngineStats, Granularity, MetricDescriptor,
    MetricId, StreamEngine, StreamError, StreamResult, Tags,
};

pub use stream::{create_backend, Backend, DataStream, NullBackend};

pub use config::{BackendConfig, Config, ConfigError, DownsampleConfig, LoggingConfig};

pub use clock::{Clock, ManualClock, SystemClock};
