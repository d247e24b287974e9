use crate::config::Config;
use crate::storage::{EngineConfig, StreamEngine, StreamError, StreamResult};
use crate::stream::Backend;
use std::sync::Arc;
use std::time::Duration;

/// Select and initialize the backend named by the configuration
///
/// Returns `None` when no backend is configured. The memory backend starts
/// its background downsampling task when that is enabled.
pub async fn create_backend(config: &Config) -> StreamResult<Option<Arc<dyn Backend>>> {
    let kind = config
        .backend
        .kind
        .as_deref()
        .map(str::trim)
        .unwrap_or("none");

    Ok(match kind {
        "" | "none" => None,

        "memory" => {
            let engine_config = EngineConfig {
                data_dir: config.backend.data_dir.clone(),
            };
            let engine = Arc::new(StreamEngine::open(engine_config).await.map_err(|e| {
                StreamError::Configuration(format!("failed to open memory backend: {}", e))
            })?);

            if config.downsample.enabled && config.downsample.interval_secs > 0 {
                engine.start_background_downsample(Duration::from_secs(
                    config.downsample.interval_secs,
                ));
            }

            let backend: Arc<dyn Backend> = engine;
            Some(backend)
        }

        other => {
            return Err(StreamError::Configuration(format!(
                "unknown data stream backend '{}'",
                other
            )))
        }
    })
}
