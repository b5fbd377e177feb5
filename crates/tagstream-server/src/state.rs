//! Application state and lifecycle

use crate::config::ServerConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tagstream_classifiers::{HttpTagRetriever, TagRetriever, TaggerCache};
use tagstream_engine::{ClassificationEngine, HttpTaggingPublisher, TaggingPublisher};
use tagstream_store::ItemCache;
use tracing::info;

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<ServerConfig>,

    /// Item store
    pub items: Arc<ItemCache>,

    /// Tagger cache shared with the engine
    pub taggers: TaggerCache,

    /// Classification job engine
    pub engine: Arc<ClassificationEngine>,

    /// Prometheus metrics handle for rendering
    pub metrics_handle: PrometheusHandle,
}

/// Owns the long-lived components between startup and shutdown
pub struct AppContext {
    state: AppState,
}

impl AppContext {
    /// Open the store and start the engine with HTTP collaborators
    pub fn build(config: ServerConfig, metrics_handle: PrometheusHandle) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.tagger_cache.http_timeout_secs);
        let credentials = config.active_credentials().cloned();
        let retriever = Arc::new(HttpTagRetriever::new(credentials.clone(), timeout)?);
        let publisher = Arc::new(HttpTaggingPublisher::new(credentials, timeout)?);
        Self::with_collaborators(config, metrics_handle, retriever, publisher)
    }

    /// Open the store and start the engine with the given collaborators
    pub fn with_collaborators(
        config: ServerConfig,
        metrics_handle: PrometheusHandle,
        retriever: Arc<dyn TagRetriever>,
        publisher: Arc<dyn TaggingPublisher>,
    ) -> anyhow::Result<Self> {
        let items = ItemCache::create(&config.store.path, config.store.options.clone())?;
        items.load()?;
        info!(
            path = %config.store.path.display(),
            items = items.cached_size(),
            "Item store loaded"
        );
        let items = Arc::new(items);

        let taggers = TaggerCache::new(
            Arc::clone(&items),
            retriever,
            config.tagger_cache.fetch_threads,
        )?;
        taggers.set_failed_tag_limit(config.tagger_cache.max_failed_tags);
        let engine = ClassificationEngine::new(config.engine.clone(), taggers.clone(), publisher);
        engine.start()?;

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                items,
                taggers,
                engine: Arc::new(engine),
                metrics_handle,
            },
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Finish in-flight jobs and stop the workers. Waiting jobs are left
    /// unprocessed.
    pub fn shutdown(self) {
        info!(
            waiting = self.state.engine.num_waiting_jobs(),
            "Stopping classification engine"
        );
        self.state.engine.suspend();
        self.state.engine.stop();
        info!("Classification engine shut down");
    }
}
