//! Backend used when none is configured

use crate::storage::{Datapoint, Granularity, MetricDescriptor, MetricId, StreamResult, Tags};
use crate::stream::Backend;
use async_trait::async_trait;

/// Accepts every call: reads return empty results and writes are dropped
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

#[async_trait]
impl Backend for NullBackend {
    fn name(&self) -> &str {
        "none"
    }

    async fn ensure_metric(
        &self,
        _query_tags: &Tags,
        _tags: &Tags,
        _downsamplers: &[String],
        _highest_granularity: Granularity,
    ) -> StreamResult<Option<MetricId>> {
        Ok(None)
    }

    async fn get_tags(&self, _metric_id: &MetricId) -> StreamResult<Tags> {
        Ok(Tags::new())
    }

    async fn update_tags(&self, _metric_id: &MetricId, _tags: Tags) -> StreamResult<()> {
        Ok(())
    }

    async fn find_metrics(&self, _query_tags: &Tags) -> StreamResult<Vec<MetricDescriptor>> {
        Ok(Vec::new())
    }

    async fn insert(&self, _metric_id: &MetricId, _value: f64) -> StreamResult<()> {
        Ok(())
    }

    async fn get_data(
        &self,
        _metric_id: &MetricId,
        _granularity: Granularity,
        _start: i64,
        _end: i64,
    ) -> StreamResult<Vec<Datapoint>> {
        Ok(Vec::new())
    }

    async fn downsample_metrics(&self, _query_tags: &Tags) -> StreamResult<()> {
        Ok(())
    }
}
