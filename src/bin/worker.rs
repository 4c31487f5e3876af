use id_doc_pipeline::{
    app_state::AppState,
    config::{AppConfig, WorkerRole},
    db::{self, DocumentStore, MemoryDocumentStore, PgDocumentStore},
    services::{
        encryption::EncryptionService,
        processor::DocumentProcessor,
        queue::RedisQueueFactory,
        recognition::{RxingBarcodeDecoder, WorkersAiRecognizer},
        storage::{ImageStore, LocalImageStore, R2ImageStore},
        webhook::{ReqwestTransport, RetryPolicy},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!(role = ?config.worker_role, "Starting document worker");

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL");
            let pool = db::init_pool(url).await.expect("Failed to connect to database");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, document records are kept in memory");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let encryption = config.encryption_key.as_deref().map(|key| {
        Arc::new(EncryptionService::new(key).expect("Failed to initialize encryption"))
    });
    let images: Arc<dyn ImageStore> = match config.r2() {
        Some((bucket, endpoint, access_key, secret_key)) => Arc::new(
            R2ImageStore::new(bucket, endpoint, access_key, secret_key, encryption)
                .expect("Failed to initialize R2 client"),
        ),
        None => {
            tracing::info!(root = %config.image_root, "Reading images from local storage");
            Arc::new(LocalImageStore::new(&config.image_root))
        }
    };

    let queues = RedisQueueFactory::new(&config.redis_url, config.visibility_timeout())
        .expect("Failed to initialize queue client");
    queues.health_check().await.expect("Redis is not reachable");

    let (account_id, api_token) = config
        .cf_account_id
        .clone()
        .zip(config.cf_api_token.clone())
        .expect("CF_ACCOUNT_ID and CF_API_TOKEN are required");
    let recognizer = WorkersAiRecognizer::new(
        account_id,
        api_token,
        config.cf_model.clone(),
        Duration::from_secs(config.recognition_timeout_secs),
    )
    .expect("Failed to initialize Workers AI client");
    let processor = DocumentProcessor::new(Arc::new(RxingBarcodeDecoder::new()), Arc::new(recognizer));

    let poll_interval = config.poll_interval();
    let role = config.worker_role;
    let document_type = config.worker_document_type;
    let webhook_timeout = Duration::from_secs(config.webhook_timeout_secs);
    let state = AppState::new(config, store, images, Arc::new(queues), processor);

    match role {
        WorkerRole::Extract => {
            let pipeline = state.extraction_pipeline(document_type);
            tracing::info!(%document_type, queue = %state.config.queue_for(document_type), "Worker ready");
            poll(poll_interval, || pipeline.run_once()).await;
        }
        WorkerRole::Webhook => {
            let transport =
                ReqwestTransport::new(webhook_timeout).expect("Failed to initialize webhook client");
            let worker = state.webhook_worker(Arc::new(transport), RetryPolicy::default());
            tracing::info!(queue = %state.config.queue_extracted, "Webhook worker ready");
            poll(poll_interval, || worker.run_once()).await;
        }
    }
}

/// Drive one consumer forever; sleep only when the queue was empty or unreachable.
async fn poll<F, Fut>(interval: Duration, mut run_once: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = id_doc_pipeline::error::Result<usize>>,
{
    loop {
        match run_once().await {
            Ok(0) => {
                tracing::trace!("No messages available, sleeping");
                sleep(interval).await;
            }
            Ok(handled) => {
                tracing::debug!(handled, "Batch handled, checking for more");
            }
            Err(e) => {
                tracing::error!(error = %e, "Queue error, will retry");
                sleep(interval).await;
            }
        }
    }
}

fn describe_metrics() {
    metrics::describe_counter!("documents_processed_total", "Documents extracted successfully");
    metrics::describe_counter!("documents_failed_total", "Documents that ended in the failed state");
    metrics::describe_counter!("documents_dead_lettered_total", "Messages routed to a dead-letter queue");
    metrics::describe_histogram!("document_processing_seconds", "End-to-end extraction time per document");
    metrics::describe_counter!("webhook_deliveries_total", "Webhooks acknowledged by the client");
    metrics::describe_counter!("webhook_failures_total", "Webhooks abandoned after all attempts");
    metrics::describe_gauge!("queue_depth", "Visible messages in a work queue");
}
