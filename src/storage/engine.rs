//! Datastream Storage Engine
//!
//! The reference backend behind the [`DataStream`](crate::DataStream) facade.
//! It orchestrates all components:
//! - Metrics: ensure / tags → MetricRegistry (metadata + TagIndex, one lock)
//! - Write path: insert → SeriesStore partition of the metric
//! - Read path: get_data → SeriesStore partition → tier range
//! - Rollups: downsample_metrics → TagIndex match → per-metric downsample
//!
//! Thread-safe via Tokio's async locks. When a data directory is configured
//! the engine keeps a snapshot on disk: metric metadata as JSON, datapoints
//! as bincode.

use crate::clock::{Clock, SystemClock};
use crate::index::TagIndex;
use crate::storage::downsampler::{Downsampler, DownsamplerRegistry};
use crate::storage::error::{StreamError, StreamResult};
use crate::storage::series::{MetricSeries, SeriesStore};
use crate::storage::types::{Datapoint, Granularity, MetricDescriptor, MetricId, Tags};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration};

/// Configuration for the storage engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Snapshot directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
    /// In-memory engine
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Engine persisting snapshots under `data_dir`
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
        }
    }

    /// Get path to metrics registry file
    pub fn metrics_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("meta").join("metrics.json"))
    }

    /// Get path to series snapshot file
    pub fn series_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join("series").join("series.bin"))
    }
}

/// Replace `path` with `bytes` through a sibling temp file and a rename
fn write_replace(path: &Path, bytes: &[u8]) -> StreamResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Registry for metric definitions and their tag index
#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: BTreeMap<MetricId, MetricDescriptor>,
    index: TagIndex,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from JSON file
    pub fn load(path: &Path) -> StreamResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = std::fs::read_to_string(path)?;
        let metrics: Vec<MetricDescriptor> = serde_json::from_str(&content)?;

        let mut registry = Self::new();
        for metric in metrics {
            registry.add(metric);
        }

        Ok(registry)
    }

    /// Save to JSON file
    pub fn save(&self, path: &Path) -> StreamResult<()> {
        let metrics: Vec<&MetricDescriptor> = self.metrics.values().collect();
        let content = serde_json::to_string_pretty(&metrics)?;
        write_replace(path, content.as_bytes())
    }

    fn add(&mut self, metric: MetricDescriptor) {
        self.index.insert(metric.id, &metric.query_tags, &metric.tags);
        self.metrics.insert(metric.id, metric);
    }

    /// Return the metric registered under `query_tags`, creating it if needed
    ///
    /// Returns the id and whether the metric was created by this call.
    pub fn ensure(
        &mut self,
        query_tags: &Tags,
        tags: &Tags,
        downsamplers: &[String],
        highest_granularity: Granularity,
    ) -> (MetricId, bool) {
        if let Some(id) = self.index.lookup(query_tags) {
            return (id, false);
        }

        let mut all_tags = tags.clone();
        all_tags.extend(query_tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        let metric = MetricDescriptor {
            id: MetricId::new(),
            tags: all_tags,
            query_tags: query_tags.clone(),
            downsamplers: downsamplers.to_vec(),
            highest_granularity,
        };
        let id = metric.id;
        self.add(metric);
        (id, true)
    }

    /// Get metric by ID
    pub fn get(&self, id: &MetricId) -> StreamResult<&MetricDescriptor> {
        self.metrics.get(id).ok_or(StreamError::UnknownMetric(*id))
    }

    /// Overwrite a metric's tags
    pub fn update_tags(&mut self, id: &MetricId, tags: Tags) -> StreamResult<()> {
        let metric = self
            .metrics
            .get_mut(id)
            .ok_or(StreamError::UnknownMetric(*id))?;
        metric.tags = tags;
        self.index.reindex(*id, &metric.query_tags, &metric.tags);
        Ok(())
    }

    /// Metrics whose tags contain every pair of `query_tags`
    pub fn find(&self, query_tags: &Tags) -> Vec<MetricDescriptor> {
        self.index
            .find_all(query_tags)
            .iter()
            .filter_map(|id| self.metrics.get(id))
            .cloned()
            .collect()
    }

    /// Get all metrics
    pub fn all(&self) -> Vec<MetricDescriptor> {
        self.metrics.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// The reference datastream backend
pub struct StreamEngine {
    /// Configuration
    config: EngineConfig,
    /// Time source for inserts and bucket closing
    clock: Arc<dyn Clock>,
    /// Metric metadata and tag index
    metrics: RwLock<MetricRegistry>,
    /// Datapoints
    series: SeriesStore,
    /// Named downsampler functions
    downsamplers: RwLock<DownsamplerRegistry>,
    /// Shutdown signal
    shutdown: RwLock<bool>,
    /// Serializes snapshot writers
    persist_lock: Mutex<()>,
}

impl StreamEngine {
    /// Open an engine, loading an existing snapshot if there is one
    pub async fn open(config: EngineConfig) -> StreamResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// In-memory engine on the system clock
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// In-memory engine on a custom clock
    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            config: EngineConfig::in_memory(),
            clock,
            metrics: RwLock::new(MetricRegistry::new()),
            series: SeriesStore::new(),
            downsamplers: RwLock::new(DownsamplerRegistry::with_builtins()),
            shutdown: RwLock::new(false),
            persist_lock: Mutex::new(()),
        }
    }

    /// Open an engine on a custom clock
    pub async fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> StreamResult<Self> {
        let metrics = match config.metrics_path() {
            Some(path) => MetricRegistry::load(&path)?,
            None => MetricRegistry::new(),
        };

        let mut snapshot: HashMap<MetricId, MetricSeries> = match config.series_path() {
            Some(path) if path.exists() => {
                let bytes = std::fs::read(&path)?;
                bincode::deserialize(&bytes)?
            }
            _ => HashMap::new(),
        };

        // Every registered metric gets a partition, even if it never had data
        for metric in metrics.all() {
            snapshot
                .entry(metric.id)
                .or_insert_with(|| MetricSeries::new(metric.highest_granularity));
        }

        if let Some(dir) = &config.data_dir {
            tracing::info!(
                "Loaded {} metrics from {:?}",
                metrics.len(),
                dir
            );
        }

        Ok(Self {
            config,
            clock,
            metrics: RwLock::new(metrics),
            series: SeriesStore::from_snapshot(snapshot),
            downsamplers: RwLock::new(DownsamplerRegistry::with_builtins()),
            shutdown: RwLock::new(false),
            persist_lock: Mutex::new(()),
        })
    }

    /// Ensure that a metric exists for `query_tags`
    pub async fn ensure_metric(
        &self,
        query_tags: &Tags,
        tags: &Tags,
        downsamplers: &[String],
        highest_granularity: Granularity,
    ) -> StreamResult<MetricId> {
        // Fast path without the write lock
        if let Some(id) = self.metrics.read().await.index.lookup(query_tags) {
            return Ok(id);
        }

        let mut registry = self.metrics.write().await;
        let (id, created) = registry.ensure(query_tags, tags, downsamplers, highest_granularity);

        if created {
            self.series.create(id, highest_granularity).await;
            if let Some(path) = self.config.metrics_path() {
                registry.save(&path)?;
            }
            tracing::debug!("Created metric {} for {:?}", id, query_tags);
        }

        Ok(id)
    }

    /// Get the tags of a metric
    pub async fn get_tags(&self, id: &MetricId) -> StreamResult<Tags> {
        let registry = self.metrics.read().await;
        Ok(registry.get(id)?.tags.clone())
    }

    /// Overwrite the tags of a metric
    pub async fn update_tags(&self, id: &MetricId, tags: Tags) -> StreamResult<()> {
        let mut registry = self.metrics.write().await;
        registry.update_tags(id, tags)?;

        if let Some(path) = self.config.metrics_path() {
            registry.save(&path)?;
        }
        Ok(())
    }

    /// Find metrics matching all of `query_tags` (empty matches all)
    pub async fn find_metrics(&self, query_tags: &Tags) -> Vec<MetricDescriptor> {
        self.metrics.read().await.find(query_tags)
    }

    /// Get a metric descriptor
    pub async fn metric(&self, id: &MetricId) -> StreamResult<MetricDescriptor> {
        let registry = self.metrics.read().await;
        registry.get(id).cloned()
    }

    /// Get all registered metrics
    pub async fn metrics(&self) -> Vec<MetricDescriptor> {
        self.metrics.read().await.all()
    }

    /// Insert a value timestamped with the current time
    ///
    /// Never lands in a sealed bucket: if downsampling has already moved past
    /// the clock, the point is stored at the first unsealed timestamp.
    pub async fn insert(&self, id: &MetricId, value: f64) -> StreamResult<()> {
        self.series
            .insert_now(id, self.clock.as_ref(), value)
            .await?;
        Ok(())
    }

    /// Insert a value at an explicit timestamp (Unix milliseconds)
    pub async fn insert_at(&self, id: &MetricId, value: f64, timestamp: i64) -> StreamResult<()> {
        self.series.insert(id, timestamp, value).await
    }

    /// Datapoints of a metric at `granularity` with `start <= t <= end`
    pub async fn get_data(
        &self,
        id: &MetricId,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> StreamResult<Vec<Datapoint>> {
        self.series.range(id, granularity, start, end).await
    }

    /// Downsample every metric matching `query_tags`
    ///
    /// Returns the number of buckets written.
    pub async fn downsample_metrics(&self, query_tags: &Tags) -> StreamResult<usize> {
        let metrics = self.find_metrics(query_tags).await;
        let now = self.clock.now_millis();
        let mut written = 0;

        for metric in metrics {
            let functions = self.downsamplers.read().await.resolve(&metric.downsamplers)?;

            let partition = self.series.partition(&metric.id).await?;
            let count = partition.lock().await.downsample(now, &functions);

            if count > 0 {
                tracing::debug!("Downsampled metric {}: {} buckets", metric.id, count);
            }
            written += count;
        }

        Ok(written)
    }

    /// Drop all derived tiers of matching metrics and recompute them
    pub async fn rebuild_downsampled(&self, query_tags: &Tags) -> StreamResult<usize> {
        for metric in self.find_metrics(query_tags).await {
            let partition = self.series.partition(&metric.id).await?;
            partition.lock().await.clear_derived();
        }
        self.downsample_metrics(query_tags).await
    }

    /// Make an additional downsampler function available to metrics
    pub async fn register_downsampler(&self, downsampler: Arc<dyn Downsampler>) {
        self.downsamplers.write().await.register(downsampler);
    }

    /// Write the snapshot to the data directory, if configured
    pub async fn persist(&self) -> StreamResult<()> {
        let (Some(metrics_path), Some(series_path)) =
            (self.config.metrics_path(), self.config.series_path())
        else {
            return Ok(());
        };

        let _writer = self.persist_lock.lock().await;

        // Hold the registry lock so no metric is created between the two files
        let registry = self.metrics.read().await;
        registry.save(&metrics_path)?;

        let snapshot = self.series.snapshot().await;
        let bytes = bincode::serialize(&snapshot)?;
        write_replace(&series_path, &bytes)?;

        tracing::debug!("Persisted {} series to {:?}", snapshot.len(), series_path);
        Ok(())
    }

    /// Get storage statistics
    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            metric_count: self.metrics.read().await.len(),
            points: self.series.point_counts().await,
        }
    }

    /// Start background downsampling task
    pub fn start_background_downsample(
        self: &Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;

                if *engine.shutdown.read().await {
                    break;
                }

                if let Err(e) = engine.downsample_metrics(&Tags::new()).await {
                    tracing::error!("Background downsample failed: {}", e);
                }
                if let Err(e) = engine.persist().await {
                    tracing::error!("Background persist failed: {}", e);
                }
            }
        })
    }

    /// Shutdown the engine gracefully
    pub async fn shutdown(&self) -> StreamResult<()> {
        *self.shutdown.write().await = true;
        self.persist().await
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub metric_count: usize,
    /// Stored points per granularity, over all metrics
    pub points: BTreeMap<Granularity, usize>,
}

impl EngineStats {
    pub fn total_points(&self) -> usize {
        self.points.values().sum()
    }
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Metrics: {}, Points: {}", self.metric_count, self.total_points())?;
        for (granularity, count) in &self.points {
            write!(f, ", {}: {}", granularity, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::types::tags;
    use tempfile::tempdir;

    const MINUTE: i64 = 60_000;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    /// Fixed start on a day boundary
    const T0: i64 = 1_700_000_000_000 / DAY * DAY;

    fn test_engine() -> (StreamEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(T0));
        let engine = StreamEngine::in_memory_with_clock(clock.clone());
        (engine, clock)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_ensure_metric_idempotent() {
        let (engine, _clock) = test_engine();
        let query = tags([("host", "a")]);

        let first = engine
            .ensure_metric(&query, &tags([("env", "prod")]), &names(&["mean"]), Granularity::Minutes)
            .await
            .unwrap();
        let second = engine
            .ensure_metric(&query, &tags([("env", "dev")]), &names(&["max"]), Granularity::Seconds)
            .await
            .unwrap();

        assert_eq!(first, second);

        // Later arguments are ignored for an existing metric
        let metric = engine.metric(&first).await.unwrap();
        assert_eq!(metric.tags, tags([("host", "a"), ("env", "prod")]));
        assert_eq!(metric.downsamplers, names(&["mean"]));
        assert_eq!(metric.highest_granularity, Granularity::Minutes);
    }

    #[tokio::test]
    async fn test_ensure_metric_concurrent() {
        let engine = Arc::new(StreamEngine::in_memory());
        let query = tags([("host", "a"), ("metric", "load")]);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let query = query.clone();
                tokio::spawn(async move {
                    engine
                        .ensure_metric(&query, &Tags::new(), &names(&["mean"]), Granularity::Seconds)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(engine.metrics().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_tags() {
        let (engine, _clock) = test_engine();
        let query = tags([("host", "a")]);
        let id = engine
            .ensure_metric(&query, &tags([("env", "prod")]), &names(&["mean"]), Granularity::Minutes)
            .await
            .unwrap();

        let update = tags([("team", "infra")]);
        engine.update_tags(&id, update.clone()).await.unwrap();

        assert_eq!(engine.get_tags(&id).await.unwrap(), update);

        let found = engine.find_metrics(&query).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert!(engine.find_metrics(&tags([("env", "prod")])).await.is_empty());

        // Identity is unchanged
        let again = engine
            .ensure_metric(&query, &Tags::new(), &[], Granularity::Seconds)
            .await
            .unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_unknown_metric_errors() {
        let (engine, _clock) = test_engine();
        let id = MetricId::new();

        assert!(matches!(
            engine.get_tags(&id).await,
            Err(StreamError::UnknownMetric(_))
        ));
        assert!(matches!(
            engine.update_tags(&id, Tags::new()).await,
            Err(StreamError::UnknownMetric(_))
        ));
        assert!(matches!(
            engine.insert(&id, 1.0).await,
            Err(StreamError::UnknownMetric(_))
        ));
        assert!(matches!(
            engine.get_data(&id, Granularity::Hours, 0, 1).await,
            Err(StreamError::UnknownMetric(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_and_get_data_roundtrip() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Seconds)
            .await
            .unwrap();

        let values = [3.0, 1.0, 4.0, 1.0, 5.0];
        for v in values {
            engine.insert(&id, v).await.unwrap();
            clock.advance(1_500);
        }

        let points = engine
            .get_data(&id, Granularity::Seconds, T0, T0 + 4 * 1_500)
            .await
            .unwrap();

        assert_eq!(points.len(), values.len());
        for (i, (point, value)) in points.iter().zip(values).enumerate() {
            assert_eq!(point.t, T0 + i as i64 * 1_500);
            assert_eq!(point.v.as_raw(), Some(value));
        }
    }

    #[tokio::test]
    async fn test_mean_scenario() {
        let (engine, clock) = test_engine();
        let query = tags([("host", "a")]);
        let id = engine
            .ensure_metric(&query, &tags([("env", "prod")]), &names(&["mean"]), Granularity::Minutes)
            .await
            .unwrap();

        clock.set(T0 + 10_000);
        engine.insert(&id, 5.0).await.unwrap();
        clock.set(T0 + 20_000);
        engine.insert(&id, 7.0).await.unwrap();

        // Hour still open: nothing to roll
        engine.downsample_metrics(&query).await.unwrap();
        assert!(engine
            .get_data(&id, Granularity::Hours, T0, T0)
            .await
            .unwrap()
            .is_empty());

        clock.set(T0 + HOUR);
        engine.downsample_metrics(&query).await.unwrap();

        let hours = engine.get_data(&id, Granularity::Hours, T0, T0).await.unwrap();
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].t, T0);
        assert_eq!(hours[0].v.get("mean"), Some(6.0));
    }

    #[tokio::test]
    async fn test_downsample_twice_is_stable() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean", "min", "max"]), Granularity::Seconds)
            .await
            .unwrap();

        for i in 0..120 {
            engine.insert(&id, (i % 7) as f64).await.unwrap();
            clock.advance(30_000);
        }

        clock.advance(2 * HOUR);
        engine.downsample_metrics(&Tags::new()).await.unwrap();
        let first = engine
            .get_data(&id, Granularity::Minutes, T0, T0 + 4 * HOUR)
            .await
            .unwrap();

        let written = engine.downsample_metrics(&Tags::new()).await.unwrap();
        let second = engine
            .get_data(&id, Granularity::Minutes, T0, T0 + 4 * HOUR)
            .await
            .unwrap();

        assert_eq!(written, 0);
        assert_eq!(first, second);
        assert_eq!(first.len(), 60);

        // A full recompute reproduces the same values
        engine.rebuild_downsampled(&Tags::new()).await.unwrap();
        let rebuilt = engine
            .get_data(&id, Granularity::Minutes, T0, T0 + 4 * HOUR)
            .await
            .unwrap();
        assert_eq!(first, rebuilt);
    }

    #[tokio::test]
    async fn test_unsupported_downsampler() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean", "median"]), Granularity::Minutes)
            .await
            .unwrap();
        engine.insert(&id, 1.0).await.unwrap();
        clock.advance(2 * HOUR);

        let err = engine.downsample_metrics(&Tags::new()).await.unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedDownsampler(name) if name == "median"));
        // Nothing was written for the failing metric
        assert!(engine
            .get_data(&id, Granularity::Hours, 0, i64::MAX)
            .await
            .unwrap()
            .is_empty());

        engine
            .register_downsampler(Arc::new(crate::storage::downsampler::FnDownsampler::new(
                "median",
                |a| (a.min + a.max) / 2.0,
            )))
            .await;
        assert_eq!(engine.downsample_metrics(&Tags::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_boundary_query() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["count"]), Granularity::Minutes)
            .await
            .unwrap();

        clock.set(T0 + MINUTE);
        engine.insert(&id, 1.0).await.unwrap();

        clock.set(T0 + HOUR - 1);
        engine.downsample_metrics(&Tags::new()).await.unwrap();
        assert!(engine.get_data(&id, Granularity::Hours, T0, T0).await.unwrap().is_empty());

        clock.set(T0 + HOUR);
        engine.downsample_metrics(&Tags::new()).await.unwrap();
        let points = engine.get_data(&id, Granularity::Hours, T0, T0).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].v.get("count"), Some(1.0));
    }

    #[tokio::test]
    async fn test_insert_into_sealed_bucket_rejected() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Minutes)
            .await
            .unwrap();

        engine.insert(&id, 1.0).await.unwrap();
        clock.advance(HOUR);
        engine.downsample_metrics(&Tags::new()).await.unwrap();

        let err = engine.insert_at(&id, 2.0, T0 + 5).await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidTimestamp { .. }));
        engine.insert(&id, 2.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_downsample_respects_query_tags() {
        let (engine, clock) = test_engine();
        let a = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["sum"]), Granularity::Minutes)
            .await
            .unwrap();
        let b = engine
            .ensure_metric(&tags([("host", "b")]), &Tags::new(), &names(&["sum"]), Granularity::Minutes)
            .await
            .unwrap();

        engine.insert(&a, 1.0).await.unwrap();
        engine.insert(&b, 2.0).await.unwrap();
        clock.advance(HOUR);

        engine.downsample_metrics(&tags([("host", "a")])).await.unwrap();
        assert_eq!(engine.get_data(&a, Granularity::Hours, T0, T0).await.unwrap().len(), 1);
        assert!(engine.get_data(&b, Granularity::Hours, T0, T0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(T0));
        let config = EngineConfig::persistent(dir.path());

        let id;

        // First session: create, write, downsample, shut down
        {
            let engine = StreamEngine::with_clock(config.clone(), clock.clone()).await.unwrap();
            id = engine
                .ensure_metric(&tags([("host", "a")]), &tags([("env", "prod")]), &names(&["mean"]), Granularity::Minutes)
                .await
                .unwrap();
            engine.insert(&id, 5.0).await.unwrap();
            clock.advance(1_000);
            engine.insert(&id, 7.0).await.unwrap();
            clock.set(T0 + HOUR);
            engine.downsample_metrics(&Tags::new()).await.unwrap();
            engine.shutdown().await.unwrap();
        }

        assert!(dir.path().join("meta").join("metrics.json").exists());
        assert!(dir.path().join("series").join("series.bin").exists());

        // Second session: everything is back
        {
            let engine = StreamEngine::with_clock(config, clock.clone()).await.unwrap();

            let again = engine
                .ensure_metric(&tags([("host", "a")]), &Tags::new(), &[], Granularity::Seconds)
                .await
                .unwrap();
            assert_eq!(again, id);
            assert_eq!(engine.get_tags(&id).await.unwrap(), tags([("host", "a"), ("env", "prod")]));

            let raw = engine.get_data(&id, Granularity::Minutes, T0, T0 + HOUR).await.unwrap();
            assert_eq!(raw.len(), 2);

            let hours = engine.get_data(&id, Granularity::Hours, T0, T0).await.unwrap();
            assert_eq!(hours[0].v.get("mean"), Some(6.0));

            // Sealed state survives restarts
            assert!(engine.insert_at(&id, 1.0, T0).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_stats() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Minutes)
            .await
            .unwrap();

        for _ in 0..10 {
            engine.insert(&id, 1.0).await.unwrap();
            clock.advance(MINUTE);
        }
        clock.advance(HOUR);
        engine.downsample_metrics(&Tags::new()).await.unwrap();

        let stats = engine.stats().await;
        assert_eq!(stats.metric_count, 1);
        assert_eq!(stats.points.get(&Granularity::Minutes), Some(&10));
        assert_eq!(stats.points.get(&Granularity::Hours), Some(&1));
        assert_eq!(stats.total_points(), 11);
        assert!(stats.to_string().starts_with("Metrics: 1, Points: 11"));
    }

    #[tokio::test]
    async fn test_insert_waiting_on_downsample_succeeds() {
        let clock = Arc::new(ManualClock::at(T0 + HOUR - 1));
        let engine = Arc::new(StreamEngine::in_memory_with_clock(clock.clone()));
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Seconds)
            .await
            .unwrap();

        // Hold the partition so the insert queues behind the downsample
        let partition = engine.series.partition(&id).await.unwrap();
        let mut series = partition.lock().await;

        let insert = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.insert(&id, 1.0).await }
        });
        tokio::task::yield_now().await;

        clock.set(T0 + HOUR);
        let functions = DownsamplerRegistry::with_builtins()
            .resolve(&names(&["mean"]))
            .unwrap();
        series.downsample(T0 + HOUR, &functions);
        drop(series);

        insert.await.unwrap().unwrap();

        let points = engine.get_data(&id, Granularity::Seconds, T0, T0 + DAY).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].t, T0 + HOUR);
    }

    #[tokio::test]
    async fn test_insert_with_clock_behind_watermark() {
        let (engine, clock) = test_engine();
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Minutes)
            .await
            .unwrap();

        engine.insert(&id, 1.0).await.unwrap();
        clock.set(T0 + 2 * HOUR);
        engine.downsample_metrics(&Tags::new()).await.unwrap();

        // Wall clock steps backwards
        clock.set(T0 + HOUR);
        engine.insert(&id, 2.0).await.unwrap();

        let points = engine.get_data(&id, Granularity::Minutes, T0 + HOUR, T0 + DAY).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].t, T0 + 2 * HOUR);
        assert_eq!(points[0].v.as_raw(), Some(2.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_insert_concurrent_with_downsample() {
        let clock = Arc::new(ManualClock::at(T0));
        let engine = Arc::new(StreamEngine::in_memory_with_clock(clock.clone()));
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["count"]), Granularity::Seconds)
            .await
            .unwrap();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let clock = Arc::clone(&clock);
                tokio::spawn(async move {
                    for i in 0..250 {
                        clock.advance(7_000);
                        engine.insert(&id, i as f64).await.unwrap();
                    }
                })
            })
            .collect();

        let downsampler = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                for _ in 0..100 {
                    engine.downsample_metrics(&Tags::new()).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        downsampler.await.unwrap();

        clock.advance(DAY);
        engine.downsample_metrics(&Tags::new()).await.unwrap();

        // Every stored point is counted exactly once in the minute tier
        let raw = engine.get_data(&id, Granularity::Seconds, i64::MIN, i64::MAX).await.unwrap();
        let minutes = engine.get_data(&id, Granularity::Minutes, i64::MIN, i64::MAX).await.unwrap();
        let counted: f64 = minutes.iter().filter_map(|p| p.v.get("count")).sum();
        assert!(!raw.is_empty());
        assert_eq!(counted as usize, raw.len());
    }

    #[tokio::test]
    async fn test_inserts_to_other_metrics_do_not_wait() {
        let (engine, _clock) = test_engine();
        let a = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Seconds)
            .await
            .unwrap();
        let b = engine
            .ensure_metric(&tags([("host", "b")]), &Tags::new(), &names(&["mean"]), Granularity::Seconds)
            .await
            .unwrap();

        let partition = engine.series.partition(&a).await.unwrap();
        let _held = partition.lock().await;

        tokio::time::timeout(Duration::from_secs(1), engine.insert(&b, 1.0))
            .await
            .expect("insert into another metric blocked")
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            engine.get_data(&b, Granularity::Seconds, T0, T0),
        )
        .await
        .expect("query of another metric blocked")
        .unwrap();
    }

    #[tokio::test]
    async fn test_background_downsample() {
        let (engine, clock) = test_engine();
        let engine = Arc::new(engine);
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Seconds)
            .await
            .unwrap();

        engine.insert_at(&id, 4.0, T0).await.unwrap();
        engine.insert_at(&id, 8.0, T0 + 1_000).await.unwrap();
        clock.set(T0 + HOUR);

        let handle = engine.start_background_downsample(Duration::from_millis(10));

        let hours = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let points = engine.get_data(&id, Granularity::Hours, T0, T0).await.unwrap();
                if !points.is_empty() {
                    break points;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("background downsample never ran");
        assert_eq!(hours[0].v.get("mean"), Some(6.0));

        engine.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("background task kept running after shutdown")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persist() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::at(T0));
        let config = EngineConfig::persistent(dir.path());
        let engine = Arc::new(StreamEngine::with_clock(config.clone(), clock).await.unwrap());
        let id = engine
            .ensure_metric(&tags([("host", "a")]), &Tags::new(), &names(&["mean"]), Granularity::Seconds)
            .await
            .unwrap();
        engine.insert(&id, 3.0).await.unwrap();

        for _ in 0..5 {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move { engine.persist().await })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        }
        engine.shutdown().await.unwrap();

        assert!(!dir.path().join("series").join("series.bin.tmp").exists());
        assert!(!dir.path().join("meta").join("metrics.json.tmp").exists());

        let reopened = StreamEngine::open(config).await.unwrap();
        let points = reopened.get_data(&id, Granularity::Seconds, T0, T0).await.unwrap();
        assert_eq!(points[0].v.as_raw(), Some(3.0));
    }
}
