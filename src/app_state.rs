use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DocumentStore;
use crate::models::document::DocumentType;
use crate::services::{
    dlq::{DlqRouter, WorkerErrorHandler},
    ingest::IngestionService,
    pipeline::ExtractionPipeline,
    processor::DocumentProcessor,
    queue::{dlq_name, QueueFactory},
    storage::ImageStore,
    webhook::{RetryPolicy, WebhookDispatcher, WebhookTransport, WebhookWorker},
};

/// Shared handles that every worker role is assembled from.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub images: Arc<dyn ImageStore>,
    pub queues: Arc<dyn QueueFactory>,
    pub processor: Arc<DocumentProcessor>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        images: Arc<dyn ImageStore>,
        queues: Arc<dyn QueueFactory>,
        processor: DocumentProcessor,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            images,
            queues,
            processor: Arc::new(processor),
        }
    }

    pub fn ingestion(&self) -> IngestionService {
        IngestionService::new(
            self.store.clone(),
            self.images.clone(),
            self.queues.clone(),
            self.config.queue_routes(),
        )
    }

    /// Extraction worker for one document-type queue.
    pub fn extraction_pipeline(&self, document_type: DocumentType) -> ExtractionPipeline {
        let input_name = self.config.queue_for(document_type);
        let worker = format!("ocr-{document_type}-worker");
        let router = DlqRouter::new(worker, self.queues.queue(&dlq_name(input_name)));
        ExtractionPipeline::new(
            self.queues.queue(input_name),
            self.queues.queue(&self.config.queue_extracted),
            self.store.clone(),
            self.images.clone(),
            self.processor.clone(),
            WorkerErrorHandler::new(router, self.config.max_receive_count),
        )
        .with_batch_size(self.config.batch_size)
    }

    pub fn webhook_worker(&self, transport: Arc<dyn WebhookTransport>, policy: RetryPolicy) -> WebhookWorker {
        let extracted = &self.config.queue_extracted;
        let router = DlqRouter::new("webhook-worker", self.queues.queue(&dlq_name(extracted)));
        WebhookWorker::new(
            self.queues.queue(extracted),
            WebhookDispatcher::new(transport, router, policy),
            self.config.batch_size,
        )
    }
}
