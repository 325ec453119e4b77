//! RagForge service
//!
//! Wires the store, embedder, index, generator and sessions, then answers
//! JSON-lines commands read from stdin. Replies go to stdout, logs to stderr.

use metrics_exporter_prometheus::PrometheusBuilder;
use ragforge_common::{
    cache::CacheStore,
    config::AppConfig,
    embeddings::{create_embedder, ResilientEmbedder},
    index::{InMemoryVectorIndex, VectorIndex},
    metrics, VERSION,
};
use ragforge_context::{LexicalOverlapScorer, OpenAiGenerator, RagEngine, Service, SessionStore};
use ragforge_ingestion::Ingestor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::load()?);
    init_tracing(&config);

    info!(service = %config.observability.service_name, "Starting RagForge v{}", VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    // Shared state
    let store = Arc::new(CacheStore::connect(&config).await?);
    match store.recover().await {
        Ok(report) => info!(
            replayed = report.replayed,
            remaining = report.remaining,
            quarantined = report.quarantined,
            "Startup recovery sweep finished"
        ),
        Err(e) => warn!(error = %e, "Startup recovery sweep failed"),
    }
    let monitor = Arc::clone(&store).spawn_recovery_monitor(config.redis.reconnect_interval());

    // Adapters
    let embedder = ResilientEmbedder::new(create_embedder(&config.embedding)?, &config.embedding);
    let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
    let generator = Arc::new(OpenAiGenerator::new(&config.generation)?);

    let engine = Arc::new(RagEngine::new(
        &config,
        generator,
        embedder.clone(),
        Arc::clone(&index),
        Arc::new(LexicalOverlapScorer::default()),
        Arc::clone(&store),
    ));
    let ingestor = Arc::new(Ingestor::new(&config.chunking, embedder, index, Arc::clone(&store)));
    let sessions = Arc::new(SessionStore::new(Arc::clone(&store), &config.session));
    let cleanup = Arc::clone(&sessions).spawn_cleanup(
        Duration::from_secs(config.session.cleanup_interval_secs),
        config.session.cleanup_batch_size,
    );

    let service = Arc::new(Service::new(engine, ingestor, sessions));
    info!("RagForge ready, reading commands from stdin");

    tokio::select! {
        served = service.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            served?;
            info!("Input closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
        }
    }

    cleanup.abort();
    monitor.abort();
    let pending = store.pending_count().await;
    if pending > 0 {
        error!(pending, "Shutting down with unreplayed transactions on disk");
    }
    info!("RagForge shutting down");
    Ok(())
}
