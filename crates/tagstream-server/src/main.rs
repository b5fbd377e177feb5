//! TagStream Server
//!
//! Classifies cached feed items against user-defined tags on request.

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use tagstream_core::Error;
use tagstream_server::{create_router, AppContext, Cli, ServerConfig};
use tagstream_store::ItemCache;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    info!("Starting TagStream classifier {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load(&cli.config, &cli)?;
    info!("Configuration loaded successfully");
    info!("Item store: {}", config.store.path.display());
    info!("Classification workers: {}", config.engine.worker_threads);
    if config.active_credentials().is_none() {
        warn!("No credentials configured, mutating endpoints are open");
    }

    let metrics_handle = init_metrics()?;

    if cli.init_store {
        match ItemCache::initialize(&config.store.path) {
            Ok(()) => info!("Initialized empty item store at {}", config.store.path.display()),
            Err(Error::Conflict(msg)) => warn!("Keeping existing store: {}", msg),
            Err(e) => return Err(e.into()),
        }
    }

    let addr: SocketAddr = format!("{}:{}", config.listen, config.port).parse()?;

    // Store replay and worker startup block
    let context = tokio::task::spawn_blocking(move || AppContext::build(config, metrics_handle))
        .await??;
    let app = create_router(context.state());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Classifier listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping server...");
    })
    .await?;

    tokio::task::spawn_blocking(move || context.shutdown()).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("tagstream=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tagstream=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(
        "tagstream_jobs_total",
        "Classification jobs by lifecycle state"
    );
    metrics::describe_counter!(
        "tagstream_items_classified_total",
        "Items scored by classification jobs"
    );
    metrics::describe_histogram!(
        "tagstream_job_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent running classification jobs"
    );
    metrics::describe_counter!(
        "tagstream_tagger_fetches_total",
        "Tag definition fetches by outcome"
    );
    metrics::describe_counter!(
        "tagstream_entries_added_total",
        "Entries written to the item store"
    );
    metrics::describe_gauge!("tagstream_cached_items", "Items available for classification");
    metrics::describe_counter!(
        "tagstream_auth_failures_total",
        "Requests rejected for a missing or invalid signature"
    );
    metrics::describe_counter!("tagstream_errors_total", "Total number of errors by type");

    info!("Metrics exporter initialized");
    Ok(handle)
}
