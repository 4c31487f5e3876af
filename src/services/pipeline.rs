//! Extraction worker: claims `document.uploaded.v1` messages, drives the
//! document processor and moves the record through its lifecycle.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use garde::Validate;
use metrics::{counter, gauge, histogram};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::DocumentStore;
use crate::error::{PipelineError, Result, Stage};
use crate::models::analysis::{Analysis, AuthenticityReport, LivenessReport};
use crate::models::document::{DocumentRecord, DocumentStatus};
use crate::models::event::{DocumentExtractedEvent, DocumentUploadedEvent, DOCUMENT_EXTRACTED_V1};
use crate::models::extraction::{ExtractionDetails, ProcessedDocument};
use crate::services::authenticity::AuthenticityAnalyzer;
use crate::services::dlq::{FailureContext, RetryDecision, WorkerErrorHandler};
use crate::services::liveness::LivenessAnalyzer;
use crate::services::processor::DocumentProcessor;
use crate::services::queue::{MessageQueue, QueueMessage};
use crate::services::storage::ImageStore;
use crate::services::template;

/// What happened to one claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Extracted,
    /// Record was already terminal; the message was a duplicate delivery.
    Skipped,
    Retried,
    DeadLettered,
}

pub struct ExtractionPipeline {
    input: Arc<dyn MessageQueue>,
    extracted: Arc<dyn MessageQueue>,
    store: Arc<dyn DocumentStore>,
    images: Arc<dyn ImageStore>,
    processor: Arc<DocumentProcessor>,
    errors: WorkerErrorHandler,
    authenticity: AuthenticityAnalyzer,
    liveness: LivenessAnalyzer,
    batch_size: usize,
}

impl ExtractionPipeline {
    pub fn new(
        input: Arc<dyn MessageQueue>,
        extracted: Arc<dyn MessageQueue>,
        store: Arc<dyn DocumentStore>,
        images: Arc<dyn ImageStore>,
        processor: Arc<DocumentProcessor>,
        errors: WorkerErrorHandler,
    ) -> Self {
        Self {
            input,
            extracted,
            store,
            images,
            processor,
            errors,
            authenticity: AuthenticityAnalyzer::new(),
            liveness: LivenessAnalyzer::new(),
            batch_size: 1,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Claim and finish one batch. Returns how many messages were handled.
    pub async fn run_once(&self) -> Result<usize> {
        let messages = self
            .input
            .consume(self.batch_size)
            .await
            .map_err(|e| e.into_pipeline(Stage::Event))?;
        if let Ok(depth) = self.input.size().await {
            gauge!("queue_depth", "queue" => self.input.name().to_string()).set(depth as f64);
        }
        let handled = messages.len();
        for message in messages {
            self.handle_message(message).await?;
        }
        Ok(handled)
    }

    /// Process one claim to completion. Errors returned here are queue
    /// failures while acknowledging, not extraction failures.
    pub async fn handle_message(&self, message: QueueMessage) -> Result<Outcome> {
        let started = Instant::now();
        let event = match parse_event(&message.body) {
            Ok(event) => event,
            Err(err) => {
                let context = FailureContext {
                    document_id: body_uuid(&message.body, "document_id"),
                    verification_id: body_uuid(&message.body, "verification_id"),
                };
                return self.fail(&message, err, context).await;
            }
        };
        let context = FailureContext {
            document_id: Some(event.document_id),
            verification_id: Some(event.verification_id),
        };

        let mut record = match self.store.get_by_id(event.document_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let err = PipelineError::invalid_input(Stage::Event, format!("unknown document {}", event.document_id));
                return self.fail(&message, err, context).await;
            }
            Err(e) => return self.fail(&message, e.into_pipeline(Stage::Persist), context).await,
        };

        match record.status {
            DocumentStatus::Failed => {
                info!(document_id = %record.document_id, "document already failed, dropping redelivery");
                self.ack(&message).await?;
                return Ok(Outcome::Skipped);
            }
            DocumentStatus::Extracted => {
                // A previous attempt persisted the result but may not have published it.
                info!(document_id = %record.document_id, "document already extracted, republishing result");
                let republished = self.publish(&event, &record).await;
                if let Err(err) = republished {
                    return self.fail(&message, err, context).await;
                }
                self.ack(&message).await?;
                return Ok(Outcome::Skipped);
            }
            _ => {}
        }

        if let Err(err) = self.claim(&mut record).await {
            return self.fail(&message, err, context).await;
        }
        info!(
            document_id = %record.document_id,
            document_type = %record.document_type,
            attempt = message.receive_count,
            "processing document"
        );

        match self.extract(&event, &mut record).await {
            Ok(()) => {
                self.ack(&message).await?;
                counter!("documents_processed_total", "document_type" => record.document_type.to_string()).increment(1);
                histogram!("document_processing_seconds").record(started.elapsed().as_secs_f64());
                Ok(Outcome::Extracted)
            }
            Err(err) => self.fail(&message, err, context).await,
        }
    }

    /// `pending`/`queued` → `processing`, persisted.
    async fn claim(&self, record: &mut DocumentRecord) -> Result<()> {
        if record.status == DocumentStatus::Pending {
            record
                .mark_queued()
                .map_err(|e| PipelineError::invalid_input(Stage::Persist, e))?;
        }
        record
            .mark_processing()
            .map_err(|e| PipelineError::invalid_input(Stage::Persist, e))?;
        self.store
            .update(record)
            .await
            .map_err(|e| e.into_pipeline(Stage::Persist))
    }

    async fn extract(&self, event: &DocumentUploadedEvent, record: &mut DocumentRecord) -> Result<()> {
        let bytes = self
            .images
            .fetch(&record.image_ref)
            .await
            .map_err(|e| e.into_pipeline(Stage::Fetch))?;

        let processed = self.processor.process(bytes.clone(), record.document_type).await?;
        let (authenticity, liveness) = self.analyses(event, &processed, bytes).await;
        if processed.provenance.discrepancy {
            warn!(document_id = %record.document_id, "sources disagree on the document number");
        }

        let details = ExtractionDetails {
            source: processed.source.clone(),
            provenance: processed.provenance.clone(),
            warnings: processed.warnings.clone(),
            authenticity_result: authenticity,
            liveness_result: liveness,
        };
        record
            .mark_extracted(
                processed.fields.clone(),
                processed.confidence,
                processed.processing_time_ms,
                details,
            )
            .map_err(|e| PipelineError::invalid_input(Stage::Persist, e))?;
        self.store
            .update(record)
            .await
            .map_err(|e| e.into_pipeline(Stage::Persist))?;

        self.publish(event, record).await?;
        info!(
            document_id = %record.document_id,
            source = %processed.source,
            confidence = processed.confidence,
            verified = processed.provenance.verified,
            processing_time_ms = processed.processing_time_ms,
            "document extracted"
        );
        Ok(())
    }

    /// Optional analyzers. They degrade to `Unavailable` and never fail the document.
    async fn analyses(
        &self,
        event: &DocumentUploadedEvent,
        processed: &ProcessedDocument,
        bytes: Vec<u8>,
    ) -> (Option<Analysis<AuthenticityReport>>, Option<Analysis<LivenessReport>>) {
        let authenticity = if event.check_authenticity {
            let analyzer = self.authenticity.clone();
            let variant = processed.variant;
            let result = tokio::task::spawn_blocking(move || match variant {
                // Only DNI layouts have zone templates.
                Some(variant) => analyzer.analyze_bytes(&bytes, variant.side(), template::template_for(variant)),
                None => analyzer.analyze_bytes_basic(&bytes),
            })
            .await;
            Some(result.unwrap_or_else(|e| Analysis::unavailable(format!("analysis_task_failed: {e}"))))
        } else {
            None
        };

        let liveness = if event.check_document_liveness {
            let analyzer = self.liveness.clone();
            let frames = event.frames.clone().unwrap_or_default();
            let result = tokio::task::spawn_blocking(move || analyzer.analyze(&frames)).await;
            Some(result.unwrap_or_else(|e| Analysis::unavailable(format!("analysis_task_failed: {e}"))))
        } else {
            None
        };
        (authenticity, liveness)
    }

    /// Builds the result event from the persisted record only, so a
    /// republish after redelivery carries the same body as the first one.
    async fn publish(&self, event: &DocumentUploadedEvent, record: &DocumentRecord) -> Result<()> {
        let details = record.details.clone().unwrap_or_default();
        let extracted = DocumentExtractedEvent {
            event: DOCUMENT_EXTRACTED_V1.to_string(),
            document_id: record.document_id,
            verification_id: record.verification_id,
            document_type: record.document_type,
            extracted_data: record.extracted_data.clone().unwrap_or_default(),
            confidence: record.confidence.unwrap_or_default(),
            provenance: details.provenance,
            processing_time_ms: record.processing_time_ms.unwrap_or_default(),
            source: details.source,
            errors: (!details.warnings.is_empty()).then_some(details.warnings),
            authenticity_result: details.authenticity_result,
            liveness_result: details.liveness_result,
            webhook_url: event.webhook_url.clone(),
            webhook_secret: event.webhook_secret.clone(),
            timestamp: Utc::now(),
        };
        let body = serde_json::to_value(&extracted).map_err(|e| PipelineError::invalid_input(Stage::Publish, e))?;
        self.extracted
            .publish(&body)
            .await
            .map_err(|e| e.into_pipeline(Stage::Publish))?;
        debug!(document_id = %record.document_id, queue = %self.extracted.name(), "extracted event published");
        Ok(())
    }

    /// Apply the retry policy; the record turns `failed` only when the message leaves the queue.
    async fn fail(&self, message: &QueueMessage, err: PipelineError, context: FailureContext) -> Result<Outcome> {
        warn!(
            document_id = ?context.document_id,
            stage = %err.stage,
            error_kind = %err.kind,
            attempt = message.receive_count,
            error = %err.message,
            "document processing failed"
        );

        let decision = self
            .errors
            .handle(message, &err, context)
            .await
            .map_err(|e| e.into_pipeline(Stage::Publish))?;

        match decision {
            RetryDecision::Retry { .. } => {
                self.input
                    .make_visible(&message.receipt_handle)
                    .await
                    .map_err(|e| e.into_pipeline(Stage::Event))?;
                Ok(Outcome::Retried)
            }
            RetryDecision::SentToDlq { .. } => {
                if let Some(document_id) = context.document_id {
                    self.record_failure(document_id, &err).await;
                }
                counter!("documents_failed_total", "stage" => err.stage.to_string()).increment(1);
                self.ack(message).await?;
                Ok(Outcome::DeadLettered)
            }
        }
    }

    /// Reloads the record so a half-applied in-memory transition is never persisted.
    async fn record_failure(&self, document_id: Uuid, err: &PipelineError) {
        let mut record = match self.store.get_by_id(document_id).await {
            Ok(Some(record)) if !record.status.is_terminal() => record,
            Ok(_) => return,
            Err(e) => {
                error!(%document_id, error = %e, "cannot load document to mark it failed");
                return;
            }
        };
        if let Err(e) = record.mark_failed(vec![err.to_string()]) {
            error!(%document_id, error = %e, "cannot mark document failed");
            return;
        }
        if let Err(e) = self.store.update(&record).await {
            error!(%document_id, error = %e, "failed to persist document failure");
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<()> {
        self.input
            .delete(&message.receipt_handle)
            .await
            .map_err(|e| e.into_pipeline(Stage::Event))
    }
}

fn parse_event(body: &serde_json::Value) -> Result<DocumentUploadedEvent> {
    let event: DocumentUploadedEvent = serde_json::from_value(body.clone())
        .map_err(|e| PipelineError::invalid_input(Stage::Event, format!("malformed event: {e}")))?;
    event
        .validate()
        .map_err(|e| PipelineError::invalid_input(Stage::Event, format!("invalid event: {e}")))?;
    Ok(event)
}

fn body_uuid(body: &serde_json::Value, field: &str) -> Option<Uuid> {
    body.get(field)?.as_str()?.parse().ok()
}
