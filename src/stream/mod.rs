//! Data stream facade
//!
//! [`DataStream`] forwards metric operations to a [`Backend`] chosen once,
//! when the process is wired up:
//!
//! - [`StreamEngine`](crate::storage::StreamEngine): the reference time-series backend
//! - [`NullBackend`]: used when no backend is configured; reads are empty and
//!   writes are silently dropped
//!
//! The facade holds no global state. The entry point builds one with
//! [`DataStream::from_config`] and hands it out by reference or `Arc`.

mod factory;
mod null;

pub use factory::create_backend;
pub use null::NullBackend;

use crate::config::Config;
use crate::storage::{
    Datapoint, Granularity, MetricDescriptor, MetricId, StreamEngine, StreamResult, Tags,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Operations every data stream backend provides
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &str;

    /// Ensure a metric exists for `query_tags` and return its identifier
    ///
    /// `tags` are added to the query tags when the metric is created.
    /// `downsamplers` names the aggregation functions used for coarser
    /// granularities, and `highest_granularity` is where inserts are stored.
    async fn ensure_metric(
        &self,
        query_tags: &Tags,
        tags: &Tags,
        downsamplers: &[String],
        highest_granularity: Granularity,
    ) -> StreamResult<Option<MetricId>>;

    /// Tags of a metric
    async fn get_tags(&self, metric_id: &MetricId) -> StreamResult<Tags>;

    /// Replace the tags of a metric
    async fn update_tags(&self, metric_id: &MetricId, tags: Tags) -> StreamResult<()>;

    /// All metrics whose tags contain every pair of `query_tags`
    async fn find_metrics(&self, query_tags: &Tags) -> StreamResult<Vec<MetricDescriptor>>;

    /// Insert a value timestamped now
    async fn insert(&self, metric_id: &MetricId, value: f64) -> StreamResult<()>;

    /// Datapoints at `granularity` with `start <= t <= end`, ascending
    async fn get_data(
        &self,
        metric_id: &MetricId,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> StreamResult<Vec<Datapoint>>;

    /// Downsample all metrics matching `query_tags`
    async fn downsample_metrics(&self, query_tags: &Tags) -> StreamResult<()>;

    /// Flush state before the process exits
    async fn shutdown(&self) -> StreamResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Backend for StreamEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_metric(
        &self,
        query_tags: &Tags,
        tags: &Tags,
        downsamplers: &[String],
        highest_granularity: Granularity,
    ) -> StreamResult<Option<MetricId>> {
        StreamEngine::ensure_metric(self, query_tags, tags, downsamplers, highest_granularity)
            .await
            .map(Some)
    }

    async fn get_tags(&self, metric_id: &MetricId) -> StreamResult<Tags> {
        StreamEngine::get_tags(self, metric_id).await
    }

    async fn update_tags(&self, metric_id: &MetricId, tags: Tags) -> StreamResult<()> {
        StreamEngine::update_tags(self, metric_id, tags).await
    }

    async fn find_metrics(&self, query_tags: &Tags) -> StreamResult<Vec<MetricDescriptor>> {
        Ok(StreamEngine::find_metrics(self, query_tags).await)
    }

    async fn insert(&self, metric_id: &MetricId, value: f64) -> StreamResult<()> {
        StreamEngine::insert(self, metric_id, value).await
    }

    async fn get_data(
        &self,
        metric_id: &MetricId,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> StreamResult<Vec<Datapoint>> {
        StreamEngine::get_data(self, metric_id, granularity, start, end).await
    }

    async fn downsample_metrics(&self, query_tags: &Tags) -> StreamResult<()> {
        StreamEngine::downsample_metrics(self, query_tags)
            .await
            .map(|_| ())
    }

    async fn shutdown(&self) -> StreamResult<()> {
        StreamEngine::shutdown(self).await
    }
}

/// Facade over the configured backend
#[derive(Clone)]
pub struct DataStream {
    backend: Arc<dyn Backend>,
    configured: bool,
}

impl DataStream {
    /// Wrap an explicitly chosen backend
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            configured: true,
        }
    }

    /// Facade without a backend
    pub fn null() -> Self {
        Self {
            backend: Arc::new(NullBackend),
            configured: false,
        }
    }

    /// Build the facade from configuration
    ///
    /// This is the single place a backend gets selected. Errors here are
    /// configuration errors and should abort startup.
    pub async fn from_config(config: &Config) -> StreamResult<Self> {
        match create_backend(config).await? {
            Some(backend) => {
                tracing::info!("Data stream backend: {}", backend.name());
                Ok(Self::new(backend))
            }
            None => {
                tracing::info!("No data stream backend configured, running without storage");
                Ok(Self::null())
            }
        }
    }

    /// Whether a real backend is present
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Ensure that a metric exists; `None` without a backend
    pub async fn ensure_metric(
        &self,
        query_tags: &Tags,
        tags: &Tags,
        downsamplers: &[String],
        highest_granularity: Granularity,
    ) -> StreamResult<Option<MetricId>> {
        self.backend
            .ensure_metric(query_tags, tags, downsamplers, highest_granularity)
            .await
    }

    pub async fn get_tags(&self, metric_id: &MetricId) -> StreamResult<Tags> {
        self.backend.get_tags(metric_id).await
    }

    pub async fn update_tags(&self, metric_id: &MetricId, tags: Tags) -> StreamResult<()> {
        self.backend.update_tags(metric_id, tags).await
    }

    pub async fn find_metrics(&self, query_tags: &Tags) -> StreamResult<Vec<MetricDescriptor>> {
        self.backend.find_metrics(query_tags).await
    }

    pub async fn insert(&self, metric_id: &MetricId, value: f64) -> StreamResult<()> {
        self.backend.insert(metric_id, value).await
    }

    pub async fn get_data(
        &self,
        metric_id: &MetricId,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> StreamResult<Vec<Datapoint>> {
        self.backend
            .get_data(metric_id, granularity, start, end)
            .await
    }

    pub async fn downsample_metrics(&self, query_tags: &Tags) -> StreamResult<()> {
        self.backend.downsample_metrics(query_tags).await
    }

    pub async fn shutdown(&self) -> StreamResult<()> {
        self.backend.shutdown().await
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("backend", &self.backend.name())
            .field("configured", &self.configured)
            .finish()
    }
}
