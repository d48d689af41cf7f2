use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use chunkscribe::api::{AppState, create_router};
use chunkscribe::assembler::Assembler;
use chunkscribe::config::EngineConfig;
use chunkscribe::coordinator::UploadCoordinator;
use chunkscribe::gate::Gates;
use chunkscribe::jobs::manager::JobManager;
use chunkscribe::jobs::queue::{WorkQueue, WorkQueueConfig};
use chunkscribe::logging;
use chunkscribe::processor::ChunkProcessor;
use chunkscribe::store::{KvStore, LocalObjectStore, MemoryKvStore, ObjectStore};
use chunkscribe::upstream::{HttpSpeechToText, HttpTextCorrection, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Uploads are capped well above the largest file the chunker is expected
/// to see; the chunk size bounds memory afterwards.
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration drives logging, so it loads first. Keep the guard
    // alive for the entire application lifetime.
    let config = EngineConfig::load().context("Failed to load configuration")?;
    let _log_guard =
        logging::init_logging(config.log_config()?).context("Failed to initialize logging")?;

    tracing::info!(target: "main", "Starting chunkscribe transcription engine...");

    let data_dir = config.data_dir()?;
    tracing::info!(
        target: "main",
        data_dir = %data_dir.display(),
        workers = config.max_workers,
        "Configuration loaded"
    );

    // Storage: job records in the TTL'd key/value store, chunk bytes on disk.
    let kv = Arc::new(MemoryKvStore::new());
    kv.spawn_sweeper(config.sweep_interval());
    let kv_store: Arc<dyn KvStore> = kv.clone();
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&data_dir));

    // Upstream gates and HTTP clients.
    let gates = Gates::new(config.gates.clone());
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.http_connect_timeout_secs.max(1)))
        .build()
        .context("Failed to create HTTP client")?;
    let transcriber = Arc::new(HttpSpeechToText::new(
        http.clone(),
        &config.transcription.base_url,
        config.transcription.api_key(),
        &config.transcription.model,
    ));
    let corrector = Arc::new(HttpTextCorrection::new(
        http.clone(),
        &config.correction.base_url,
        config.correction.api_key(),
        &config.correction.model,
    ));

    // Engine: manager, processor, assembler, work queue, coordinator.
    let manager = JobManager::new(kv_store, objects.clone(), config.record_ttl());
    let processor = Arc::new(ChunkProcessor::new(
        Arc::clone(&manager),
        objects.clone(),
        transcriber,
        corrector.clone(),
        Arc::clone(&gates),
    ));
    let assembler = Arc::new(Assembler::new(
        corrector,
        Arc::clone(&gates),
        RetryPolicy::correction(),
    ));
    let queue = WorkQueue::new(
        Arc::clone(&manager),
        processor,
        assembler,
        Arc::clone(&gates),
        http.clone(),
        WorkQueueConfig {
            max_concurrent: config.max_workers,
        },
    );
    let coordinator = Arc::new(UploadCoordinator::new(
        Arc::clone(&manager),
        objects,
        Arc::clone(&queue),
        Arc::clone(&gates),
        http,
        config.coordinator_config(),
    ));

    let state = AppState {
        manager,
        coordinator,
        queue: Arc::clone(&queue),
        gates,
        emitter_config: config.emitter_config(),
    };

    let app = create_router(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    tracing::info!(target: "main", "HTTP server listening on http://{}", config.bind_addr);
    tracing::info!(
        target: "main",
        "SSE streams available at http://{}/chunked-stream/{{parent_job_id}}",
        config.bind_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(queue))
        .await
        .context("Server error")?;

    tracing::info!(target: "main", "Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal and stop the work queue.
async fn shutdown_signal(queue: Arc<WorkQueue>) {
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

    tracing::info!(target: "main", "Shutdown signal received, draining workers");
    queue.shutdown().await;
}
