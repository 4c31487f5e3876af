use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, PipelineError};
use crate::models::event::DlqEntry;
use crate::services::pii;
use crate::services::queue::{MessageQueue, QueueError, QueueMessage};

/// Where a failed message goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Released for redelivery; `attempt` deliveries have been used.
    Retry { attempt: u32 },
    SentToDlq { is_final_attempt: bool },
}

/// Identifiers attached to a dead-lettered message when known.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureContext {
    pub document_id: Option<Uuid>,
    pub verification_id: Option<Uuid>,
}

/// Publishes dead-letter entries for one worker.
pub struct DlqRouter {
    worker: String,
    dlq: Arc<dyn MessageQueue>,
}

impl DlqRouter {
    pub fn new(worker: impl Into<String>, dlq: Arc<dyn MessageQueue>) -> Self {
        Self {
            worker: worker.into(),
            dlq,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.dlq.name()
    }

    /// Credentials in `original` are redacted before the entry is published.
    pub async fn send(
        &self,
        original: &serde_json::Value,
        error: &PipelineError,
        context: FailureContext,
        attempt_count: u32,
        max_receive_count: u32,
    ) -> Result<(), QueueError> {
        let entry = DlqEntry {
            error_kind: error.kind,
            error_message: error.message.clone(),
            stage: error.stage,
            worker: self.worker.clone(),
            document_id: context.document_id,
            verification_id: context.verification_id,
            attempt_count,
            max_receive_count,
            is_final_attempt: attempt_count >= max_receive_count,
            failed_at: Utc::now(),
            original_message: pii::redact_secrets(original),
        };
        self.dlq.publish(&serde_json::to_value(&entry)?).await?;
        counter!("documents_dead_lettered_total", "stage" => error.stage.to_string()).increment(1);
        error!(
            dlq = %self.dlq.name(),
            worker = %self.worker,
            stage = %error.stage,
            error_kind = %error.kind,
            attempt = attempt_count,
            document_id = ?context.document_id,
            "message dead-lettered"
        );
        Ok(())
    }
}

/// Retry policy for queue consumers: transient failures are redelivered
/// until the receive budget is spent, everything else is dead-lettered at once.
pub struct WorkerErrorHandler {
    router: DlqRouter,
    max_receive_count: u32,
}

impl WorkerErrorHandler {
    pub fn new(router: DlqRouter, max_receive_count: u32) -> Self {
        Self {
            router,
            max_receive_count: max_receive_count.max(1),
        }
    }

    pub fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }

    /// Decide and act. The caller releases the message on `Retry` and deletes it on `SentToDlq`.
    pub async fn handle(
        &self,
        message: &QueueMessage,
        error: &PipelineError,
        context: FailureContext,
    ) -> Result<RetryDecision, QueueError> {
        let attempt = message.receive_count;
        if error.is_retryable() && attempt < self.max_receive_count {
            warn!(
                stage = %error.stage,
                attempt,
                max_receive_count = self.max_receive_count,
                error = %error.message,
                "transient failure, message will be redelivered"
            );
            return Ok(RetryDecision::Retry { attempt });
        }

        let dead = if error.is_retryable() {
            PipelineError::new(
                ErrorKind::Exhausted,
                error.stage,
                format!("gave up after {attempt} attempts: {}", error.message),
            )
        } else {
            error.clone()
        };
        self.router
            .send(&message.body, &dead, context, attempt, self.max_receive_count)
            .await?;
        Ok(RetryDecision::SentToDlq {
            is_final_attempt: attempt >= self.max_receive_count,
        })
    }
}
