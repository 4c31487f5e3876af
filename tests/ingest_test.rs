mod helpers;

use std::sync::Arc;

use async_trait::async_trait;
use helpers::{card_png, upload, Harness, DNI_PAYLOAD};
use futures::future::join;
use id_doc_pipeline::{
    app_state::AppState,
    db::DocumentStore,
    models::document::{DocumentStatus, DocumentType},
    services::{
        ingest::IngestionService,
        queue::{MessageQueue, QueueError, QueueFactory, QueueMessage},
    },
};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

/// Work queue whose consumer finishes the document before `publish` returns.
struct WorkerFirstQueue {
    inner: Arc<dyn MessageQueue>,
    state: AppState,
    document_type: DocumentType,
}

#[async_trait]
impl MessageQueue for WorkerFirstQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn publish(&self, body: &serde_json::Value) -> Result<String, QueueError> {
        let id = self.inner.publish(body).await?;
        let handled = self
            .state
            .extraction_pipeline(self.document_type)
            .run_once()
            .await
            .unwrap();
        assert_eq!(handled, 1);
        Ok(id)
    }

    async fn consume(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        self.inner.consume(max).await
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.inner.delete(receipt_handle).await
    }

    async fn make_visible(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.inner.make_visible(receipt_handle).await
    }

    async fn size(&self) -> Result<usize, QueueError> {
        self.inner.size().await
    }
}

struct WorkerFirstQueues {
    state: AppState,
    document_type: DocumentType,
}

impl QueueFactory for WorkerFirstQueues {
    fn queue(&self, name: &str) -> Arc<dyn MessageQueue> {
        let inner = self.state.queues.queue(name);
        if name != self.state.config.queue_for(self.document_type) {
            return inner;
        }
        Arc::new(WorkerFirstQueue {
            inner,
            state: self.state.clone(),
            document_type: self.document_type,
        })
    }
}

#[tokio::test]
async fn test_duplicate_upload_returns_same_document() {
    let harness = Harness::new(None, None, None);
    let ingestion = harness.state.ingestion();

    let first = ingestion.submit(upload(DocumentType::Dni, card_png(20))).await.unwrap();
    let second = ingestion.submit(upload(DocumentType::Dni, card_png(20))).await.unwrap();

    assert_eq!(first.document_id, second.document_id);
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(harness.work_queue(DocumentType::Dni).size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_force_reprocess_creates_new_document() {
    let harness = Harness::new(None, None, None);
    let ingestion = harness.state.ingestion();

    let first = ingestion.submit(upload(DocumentType::Dni, card_png(21))).await.unwrap();
    let mut again = upload(DocumentType::Dni, card_png(21));
    again.force_reprocess = true;
    let forced = ingestion.submit(again).await.unwrap();

    assert_ne!(first.document_id, forced.document_id);
    assert!(!forced.duplicate);
    let record = harness.store.get_by_id(forced.document_id).await.unwrap().unwrap();
    let original = harness.store.get_by_id(first.document_id).await.unwrap().unwrap();
    assert!(record.idempotency_key.starts_with(&original.idempotency_key));
    assert_ne!(record.idempotency_key, original.idempotency_key);
    assert_eq!(harness.work_queue(DocumentType::Dni).size().await.unwrap(), 2);
}

#[tokio::test]
async fn test_same_image_other_type_is_not_duplicate() {
    let harness = Harness::new(None, None, None);
    let ingestion = harness.state.ingestion();

    let dni = ingestion.submit(upload(DocumentType::Dni, card_png(22))).await.unwrap();
    let license = ingestion.submit(upload(DocumentType::License, card_png(22))).await.unwrap();

    assert_ne!(dni.document_id, license.document_id);
    assert_eq!(harness.work_queue(DocumentType::License).size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_verification_id_is_kept() {
    let harness = Harness::new(None, None, None);
    let verification_id = Uuid::now_v7();
    let mut request = upload(DocumentType::Passport, card_png(23));
    request.verification_id = Some(verification_id);

    let receipt = harness.state.ingestion().submit(request).await.unwrap();
    assert_eq!(receipt.verification_id, verification_id);
    assert_eq!(receipt.status, DocumentStatus::Queued);
    let listed = harness.store.list(Some("acme"), 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].verification_id, verification_id);
}

#[tokio::test]
async fn test_concurrent_duplicates_collapse_to_one_document() {
    let harness = Harness::new(None, None, None);
    let ingestion = harness.state.ingestion();

    let (a, b) = join(
        ingestion.submit(upload(DocumentType::License, card_png(24))),
        ingestion.submit(upload(DocumentType::License, card_png(24))),
    )
    .await;
    let (a, b) = (assert_ok!(a), assert_ok!(b));

    assert_eq!(a.document_id, b.document_id);
    assert!(a.duplicate != b.duplicate);
    assert_eq!(harness.store.list(None, 10).await.unwrap().len(), 1);
    assert_eq!(harness.work_queue(DocumentType::License).size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_empty_image_rejected() {
    let harness = Harness::new(None, None, None);
    let err = assert_err!(harness.state.ingestion().submit(upload(DocumentType::Dni, Vec::new())).await);
    assert!(!err.is_retryable());
    assert!(harness.store.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_finishing_first_is_not_overwritten() {
    let harness = Harness::new(Some(DNI_PAYLOAD), None, None);
    let state = harness.state.clone();
    let ingestion = IngestionService::new(
        state.store.clone(),
        state.images.clone(),
        Arc::new(WorkerFirstQueues {
            state: state.clone(),
            document_type: DocumentType::Dni,
        }),
        state.config.queue_routes(),
    );

    let receipt = ingestion.submit(upload(DocumentType::Dni, card_png(25))).await.unwrap();

    let stored = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Extracted);
    assert_eq!(stored.extracted_data.as_ref().unwrap()["numero_documento"], "30111222");
    assert_eq!(receipt.status, DocumentStatus::Extracted);
    assert!(!receipt.duplicate);
}
