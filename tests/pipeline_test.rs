mod helpers;

use helpers::{card_png, upload, Harness, DNI_PAYLOAD, PASSPORT_PAGE};
use id_doc_pipeline::{
    db::DocumentStore,
    error::{ErrorKind, Stage},
    models::{
        document::{DocumentStatus, DocumentType},
        event::{DlqEntry, DocumentExtractedEvent, DocumentUploadedEvent, DOCUMENT_EXTRACTED_V1},
    },
    services::{pipeline::Outcome, queue::MessageQueue},
};
use serde_json::json;

#[tokio::test]
async fn test_dni_upload_is_extracted_and_published() {
    let harness = Harness::new(Some(DNI_PAYLOAD), None, None);
    let receipt = harness
        .state
        .ingestion()
        .submit(upload(DocumentType::Dni, card_png(1)))
        .await
        .unwrap();
    assert_eq!(receipt.status, DocumentStatus::Queued);

    let pipeline = harness.state.extraction_pipeline(DocumentType::Dni);
    assert_eq!(pipeline.run_once().await.unwrap(), 1);

    let record = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    assert_eq!(record.status, DocumentStatus::Extracted);
    let fields = record.extracted_data.as_ref().unwrap();
    assert_eq!(fields["numero_documento"], "30111222");
    assert!(record.confidence.unwrap() >= 0.9);

    let published = harness.extracted_queue().consume(10).await.unwrap();
    assert_eq!(published.len(), 1);
    let event: DocumentExtractedEvent = serde_json::from_value(published[0].body.clone()).unwrap();
    assert_eq!(event.event, DOCUMENT_EXTRACTED_V1);
    assert_eq!(event.document_id, receipt.document_id);
    assert_eq!(event.verification_id, receipt.verification_id);
    assert_eq!(event.extracted_data, *fields);
    assert!(event.authenticity_result.is_none());
    // Text recognition had nothing to offer; the degraded source is reported.
    assert!(event.errors.as_ref().is_some_and(|errors| !errors.is_empty()));

    assert_eq!(harness.work_queue(DocumentType::Dni).in_flight(), 0);
    assert_eq!(harness.work_dlq(DocumentType::Dni).size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_requested_analyses_are_attached() {
    let harness = Harness::new(None, Some(PASSPORT_PAGE), Some("no zone"));
    let mut request = upload(DocumentType::Passport, card_png(2));
    request.check_authenticity = true;
    request.check_document_liveness = true;
    harness.state.ingestion().submit(request).await.unwrap();

    let pipeline = harness.state.extraction_pipeline(DocumentType::Passport);
    pipeline.run_once().await.unwrap();

    let published = harness.extracted_queue().consume(1).await.unwrap();
    let event: DocumentExtractedEvent = serde_json::from_value(published[0].body.clone()).unwrap();
    assert_eq!(event.extracted_data["numero_pasaporte"], "AAB123456");
    assert!(event.authenticity_result.is_some());
    // No frames were supplied, so liveness degrades instead of failing the document.
    let liveness = event.liveness_result.unwrap();
    assert!(!liveness.is_available());
}

#[tokio::test]
async fn test_transient_failures_dead_letter_on_final_attempt() {
    // No canned text: every recognizer call fails as unavailable.
    let harness = Harness::new(None, None, None);
    let receipt = harness
        .state
        .ingestion()
        .submit(upload(DocumentType::License, card_png(3)))
        .await
        .unwrap();
    let pipeline = harness.state.extraction_pipeline(DocumentType::License);
    let dlq = harness.work_dlq(DocumentType::License);

    for _ in 0..2 {
        assert_eq!(pipeline.run_once().await.unwrap(), 1);
        let record = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Processing);
        assert_eq!(dlq.size().await.unwrap(), 0);
    }

    assert_eq!(pipeline.run_once().await.unwrap(), 1);
    let record = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    assert_eq!(record.status, DocumentStatus::Failed);
    assert!(record.errors.is_some());

    let entries = dlq.consume(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry: DlqEntry = serde_json::from_value(entries[0].body.clone()).unwrap();
    assert!(entry.is_final_attempt);
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(entry.error_kind, ErrorKind::Exhausted);
    assert_eq!(entry.stage, Stage::Extract);
    assert_eq!(entry.document_id, Some(receipt.document_id));

    let work = harness.work_queue(DocumentType::License);
    assert_eq!(work.size().await.unwrap(), 0);
    assert_eq!(work.in_flight(), 0);
    assert_eq!(harness.extracted_queue().size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unreadable_image_fails_without_retry() {
    let harness = Harness::new(Some(DNI_PAYLOAD), None, None);
    let receipt = harness
        .state
        .ingestion()
        .submit(upload(DocumentType::Dni, b"not an image".to_vec()))
        .await
        .unwrap();

    harness.state.extraction_pipeline(DocumentType::Dni).run_once().await.unwrap();

    let record = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    assert_eq!(record.status, DocumentStatus::Failed);
    let entries = harness.work_dlq(DocumentType::Dni).consume(10).await.unwrap();
    let entry: DlqEntry = serde_json::from_value(entries[0].body.clone()).unwrap();
    assert_eq!(entry.error_kind, ErrorKind::InvalidInput);
    assert_eq!(entry.stage, Stage::Decode);
    assert!(!entry.is_final_attempt);
}

#[tokio::test]
async fn test_malformed_event_goes_to_dlq() {
    let harness = Harness::new(None, None, None);
    let work = harness.work_queue(DocumentType::Dni);
    work.publish(&json!({"event": "document.uploaded.v1", "client_id": "acme"}))
        .await
        .unwrap();

    let pipeline = harness.state.extraction_pipeline(DocumentType::Dni);
    let message = work.consume(1).await.unwrap().remove(0);
    assert_eq!(pipeline.handle_message(message).await.unwrap(), Outcome::DeadLettered);

    let entries = harness.work_dlq(DocumentType::Dni).consume(10).await.unwrap();
    let entry: DlqEntry = serde_json::from_value(entries[0].body.clone()).unwrap();
    assert_eq!(entry.stage, Stage::Event);
    assert_eq!(entry.original_message["client_id"], "acme");
}

#[tokio::test]
async fn test_redelivery_after_extraction_republishes_without_reprocessing() {
    let harness = Harness::new(Some(DNI_PAYLOAD), None, None);
    let mut request = upload(DocumentType::Dni, card_png(4));
    request.check_authenticity = true;
    harness.state.ingestion().submit(request).await.unwrap();

    let work = harness.work_queue(DocumentType::Dni);
    let message = work.consume(1).await.unwrap().remove(0);
    let duplicate_body = message.body.clone();
    let pipeline = harness.state.extraction_pipeline(DocumentType::Dni);
    assert_eq!(pipeline.handle_message(message).await.unwrap(), Outcome::Extracted);

    // Same work item delivered again.
    work.publish(&duplicate_body).await.unwrap();
    let again = work.consume(1).await.unwrap().remove(0);
    assert_eq!(pipeline.handle_message(again).await.unwrap(), Outcome::Skipped);

    let published = harness.extracted_queue().consume(10).await.unwrap();
    assert_eq!(published.len(), 2);
    let first: DocumentExtractedEvent = serde_json::from_value(published[0].body.clone()).unwrap();
    let second: DocumentExtractedEvent = serde_json::from_value(published[1].body.clone()).unwrap();
    assert_eq!(first.extracted_data, second.extracted_data);
    assert_eq!(first.confidence, second.confidence);
    // The republished body is complete, not just the field map.
    assert_eq!(first.source, "pdf417");
    assert_eq!(second.source, first.source);
    assert_eq!(second.provenance, first.provenance);
    assert_eq!(second.errors, first.errors);
    assert!(first.authenticity_result.is_some());
    assert_eq!(second.authenticity_result, first.authenticity_result);
}

#[tokio::test]
async fn test_number_discrepancy_reaches_the_result_event() {
    let harness = Harness::new(Some(DNI_PAYLOAD), Some("DOCUMENTO 30.111.999"), None);
    let receipt = harness
        .state
        .ingestion()
        .submit(upload(DocumentType::Dni, card_png(6)))
        .await
        .unwrap();
    harness.state.extraction_pipeline(DocumentType::Dni).run_once().await.unwrap();

    let record = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    assert!(record.details.as_ref().unwrap().provenance.discrepancy);

    let published = harness.extracted_queue().consume(1).await.unwrap();
    let event: DocumentExtractedEvent = serde_json::from_value(published[0].body.clone()).unwrap();
    assert!(event.provenance.discrepancy);
    assert!(!event.provenance.verified);
    assert_eq!(event.confidence, 0.85);
    assert_eq!(event.extracted_data["numero_documento"], "30111222");
    assert!(event.webhook_payload().provenance.discrepancy);
}

#[tokio::test]
async fn test_status_never_moves_backwards() {
    let harness = Harness::new(Some(DNI_PAYLOAD), None, None);
    let receipt = harness
        .state
        .ingestion()
        .submit(upload(DocumentType::Dni, card_png(5)))
        .await
        .unwrap();
    let work = harness.work_queue(DocumentType::Dni);
    let message = work.consume(1).await.unwrap().remove(0);
    let body = message.body.clone();
    let pipeline = harness.state.extraction_pipeline(DocumentType::Dni);
    pipeline.handle_message(message).await.unwrap();

    let mut record = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    record.mark_failed(vec!["late".into()]).unwrap_err();
    record.mark_processing().unwrap_err();

    // A stale copy of the work item must not touch the extracted record.
    let event: DocumentUploadedEvent = serde_json::from_value(body).unwrap();
    work.publish(&serde_json::to_value(&event).unwrap()).await.unwrap();
    pipeline.run_once().await.unwrap();
    let after = harness.store.get_by_id(receipt.document_id).await.unwrap().unwrap();
    assert_eq!(after.status, DocumentStatus::Extracted);
    assert_eq!(after.extracted_data, record.extracted_data);
}
