//! Library-level upload entry point: dedupe, store the image, create the
//! record and enqueue the work item.

use std::sync::Arc;

use chrono::Utc;
use garde::Validate;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::QueueRoutes;
use crate::db::{DocumentStore, StoreError};
use crate::error::{PipelineError, Result, Stage};
use crate::models::document::{DocumentRecord, DocumentStatus, DocumentType};
use crate::models::event::{DocumentUploadedEvent, DOCUMENT_UPLOADED_V1};
use crate::services::idempotency::{forced_key, idempotency_key};
use crate::services::queue::QueueFactory;
use crate::services::storage::ImageStore;

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub client_id: String,
    pub document_type: Option<DocumentType>,
    pub image: Vec<u8>,
    pub content_type: Option<String>,
    pub verification_id: Option<Uuid>,
    pub force_reprocess: bool,
    pub check_authenticity: bool,
    pub check_document_liveness: bool,
    pub frames: Option<Vec<String>>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub document_id: Uuid,
    pub verification_id: Uuid,
    pub status: DocumentStatus,
    /// An earlier upload of the same image was returned instead of a new record.
    pub duplicate: bool,
}

pub struct IngestionService {
    store: Arc<dyn DocumentStore>,
    images: Arc<dyn ImageStore>,
    queues: Arc<dyn QueueFactory>,
    routes: QueueRoutes,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        images: Arc<dyn ImageStore>,
        queues: Arc<dyn QueueFactory>,
        routes: QueueRoutes,
    ) -> Self {
        Self {
            store,
            images,
            queues,
            routes,
        }
    }

    pub async fn submit(&self, request: UploadRequest) -> Result<SubmitReceipt> {
        let document_type = request
            .document_type
            .ok_or_else(|| PipelineError::invalid_input(Stage::Event, "document_type is required"))?;
        if request.image.is_empty() {
            return Err(PipelineError::invalid_input(Stage::Event, "image is empty"));
        }

        let image = request.image.clone();
        let client_id = request.client_id.clone();
        let key = tokio::task::spawn_blocking(move || idempotency_key(&client_id, document_type, &image))
            .await
            .map_err(|e| PipelineError::transient(Stage::Event, e))?;

        let key = if request.force_reprocess {
            forced_key(&key, Utc::now().timestamp_millis())
        } else {
            if let Some(existing) = self.find(&key).await? {
                info!(document_id = %existing.document_id, "duplicate upload, returning existing document");
                return Ok(receipt(&existing, true));
            }
            key
        };

        let content_type = request.content_type.as_deref().unwrap_or("application/octet-stream");
        let image_ref = self
            .images
            .put(&format!("{}/{key}.img", request.client_id), &request.image, content_type)
            .await
            .map_err(|e| e.into_pipeline(Stage::Persist))?;

        let mut record = DocumentRecord::new(
            request.client_id.clone(),
            document_type,
            image_ref.clone(),
            key.clone(),
            request.verification_id,
        );
        let event = DocumentUploadedEvent {
            event: DOCUMENT_UPLOADED_V1.to_string(),
            document_id: record.document_id,
            verification_id: record.verification_id,
            client_id: request.client_id,
            document_type,
            image_ref,
            check_authenticity: request.check_authenticity,
            check_document_liveness: request.check_document_liveness,
            frames: request.frames,
            webhook_url: request.webhook_url,
            webhook_secret: request.webhook_secret,
            timestamp: Utc::now(),
        };
        event
            .validate()
            .map_err(|e| PipelineError::invalid_input(Stage::Event, format!("invalid upload: {e}")))?;

        match self.store.save(&record).await {
            Ok(()) => {}
            // Lost a race with a concurrent identical upload.
            Err(StoreError::Duplicate(_)) => {
                if let Some(existing) = self.find(&key).await? {
                    return Ok(receipt(&existing, true));
                }
                return Err(PipelineError::transient(Stage::Persist, "idempotency key vanished"));
            }
            Err(e) => return Err(e.into_pipeline(Stage::Persist)),
        }

        let queue = self.queues.queue(self.routes.queue_for(document_type));
        let body = serde_json::to_value(&event).map_err(|e| PipelineError::invalid_input(Stage::Publish, e))?;
        if let Err(e) = queue.publish(&body).await {
            error!(document_id = %record.document_id, queue = %queue.name(), error = %e, "failed to enqueue document");
            let err = e.into_pipeline(Stage::Publish);
            if record.mark_failed(vec![err.to_string()]).is_ok() {
                if let Err(e) = self.store.update(&record).await {
                    error!(document_id = %record.document_id, error = %e, "failed to persist enqueue failure");
                }
            }
            return Err(err);
        }

        record
            .mark_queued()
            .map_err(|e| PipelineError::invalid_input(Stage::Persist, e))?;
        match self.store.update(&record).await {
            Ok(()) => {}
            // A worker claimed the message before this write landed; its status wins.
            Err(StoreError::StaleStatus { stored, .. }) => {
                info!(document_id = %record.document_id, status = %stored, "document already picked up by a worker");
                let current = self
                    .store
                    .get_by_id(record.document_id)
                    .await
                    .map_err(|e| e.into_pipeline(Stage::Persist))?
                    .ok_or_else(|| PipelineError::transient(Stage::Persist, "document vanished after enqueue"))?;
                return Ok(receipt(&current, false));
            }
            Err(e) => return Err(e.into_pipeline(Stage::Persist)),
        }

        info!(
            document_id = %record.document_id,
            document_type = %document_type,
            queue = %queue.name(),
            forced = request.force_reprocess,
            "document queued"
        );
        Ok(receipt(&record, false))
    }

    async fn find(&self, key: &str) -> Result<Option<DocumentRecord>> {
        self.store
            .get_by_idempotency_key(key)
            .await
            .map_err(|e| e.into_pipeline(Stage::Persist))
    }
}

fn receipt(record: &DocumentRecord, duplicate: bool) -> SubmitReceipt {
    SubmitReceipt {
        document_id: record.document_id,
        verification_id: record.verification_id,
        status: record.status,
        duplicate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDocumentStore;
    use crate::services::queue::{MemoryQueueFactory, MessageQueue};
    use crate::services::storage::LocalImageStore;

    fn service(queues: Arc<MemoryQueueFactory>) -> (IngestionService, Arc<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let root = std::env::temp_dir().join(format!("id-doc-ingest-{}", Uuid::new_v4()));
        let service = IngestionService::new(
            store.clone(),
            Arc::new(LocalImageStore::new(root)),
            queues,
            QueueRoutes::default(),
        );
        (service, store)
    }

    fn request(image: &[u8]) -> UploadRequest {
        UploadRequest {
            client_id: "acme".to_string(),
            document_type: Some(DocumentType::Passport),
            image: image.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_queues_work_item() {
        let queues = Arc::new(MemoryQueueFactory::new());
        let (service, store) = service(queues.clone());

        let receipt = service.submit(request(b"passport bytes")).await.unwrap();
        assert_eq!(receipt.status, DocumentStatus::Queued);
        assert!(!receipt.duplicate);

        let stored = store.get_by_id(receipt.document_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Queued);

        let queue = queues.memory_queue("queue-ocr-passport");
        let messages = queue.consume(10).await.unwrap();
        assert_eq!(messages.len(), 1);
        let event: DocumentUploadedEvent = serde_json::from_value(messages[0].body.clone()).unwrap();
        assert_eq!(event.document_id, receipt.document_id);
        assert_eq!(event.image_ref, stored.image_ref);
    }

    #[tokio::test]
    async fn test_missing_document_type_rejected() {
        let (service, _) = service(Arc::new(MemoryQueueFactory::new()));
        let mut upload = request(b"bytes");
        upload.document_type = None;
        let err = service.submit(upload).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_webhook_url_rejected_before_save() {
        let (service, store) = service(Arc::new(MemoryQueueFactory::new()));
        let mut upload = request(b"bytes");
        upload.webhook_url = Some("ftp://hooks.example.com".to_string());
        assert!(service.submit(upload).await.is_err());
        assert!(store.list(None, 10).await.unwrap().is_empty());
    }
}
