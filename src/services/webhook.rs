//! Signed delivery of extraction results to client callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, PipelineError, Result, Stage};
use crate::models::event::DocumentExtractedEvent;
use crate::services::dlq::{DlqRouter, FailureContext};
use crate::services::queue::{MessageQueue, QueueMessage};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// `sha256=<hex HMAC-SHA256(secret, body)>`.
pub fn sign(secret: &str, body: &[u8]) -> std::result::Result<String, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| WebhookError::SigningKey(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// One outbound POST.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// HTTP status of the response.
    async fn post(&self, request: &WebhookRequest) -> std::result::Result<u16, WebhookError>;
}

pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> std::result::Result<Self, WebhookError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, request: &WebhookRequest) -> std::result::Result<u16, WebhookError> {
        let mut builder = self.http.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let response = builder.send().await?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// No callback configured.
    Skipped,
    Delivered { attempts: u32, status: u16 },
    DeadLettered { attempts: u32 },
}

pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    dlq: DlqRouter,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(transport: Arc<dyn WebhookTransport>, dlq: DlqRouter, policy: RetryPolicy) -> Self {
        Self { transport, dlq, policy }
    }

    pub async fn dispatch(&self, event: &DocumentExtractedEvent) -> Result<Delivery> {
        let Some(url) = event.webhook_url.as_deref().filter(|u| !u.is_empty()) else {
            debug!(document_id = %event.document_id, "no webhook configured");
            return Ok(Delivery::Skipped);
        };

        // Serialized once so the signature covers exactly the bytes sent.
        let body = serde_json::to_vec(&event.webhook_payload())
            .map_err(|e| PipelineError::invalid_input(Stage::WebhookDelivery, e))?;
        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            (TIMESTAMP_HEADER, Utc::now().timestamp().to_string()),
        ];
        if let Some(secret) = event.webhook_secret.as_deref() {
            let signature = sign(secret, &body).map_err(|e| PipelineError::invalid_input(Stage::WebhookDelivery, e))?;
            headers.push((SIGNATURE_HEADER, signature));
        }
        let request = WebhookRequest {
            url: url.to_string(),
            body,
            headers,
        };

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            match self.transport.post(&request).await {
                Ok(status) if (200..300).contains(&status) => {
                    counter!("webhook_deliveries_total").increment(1);
                    info!(document_id = %event.document_id, attempt, status, "webhook delivered");
                    return Ok(Delivery::Delivered { attempts: attempt, status });
                }
                Ok(status) => last_error = format!("callback returned HTTP {status}"),
                Err(e) => last_error = e.to_string(),
            }
            warn!(document_id = %event.document_id, attempt, error = %last_error, "webhook attempt failed");
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        counter!("webhook_failures_total").increment(1);
        let err = PipelineError::new(
            ErrorKind::Exhausted,
            Stage::WebhookDelivery,
            format!("{} attempts failed: {last_error}", self.policy.max_attempts),
        );
        let original = serde_json::to_value(event).map_err(|e| PipelineError::invalid_input(Stage::WebhookDelivery, e))?;
        let context = FailureContext {
            document_id: Some(event.document_id),
            verification_id: Some(event.verification_id),
        };
        self.dlq
            .send(&original, &err, context, self.policy.max_attempts, self.policy.max_attempts)
            .await
            .map_err(|e| e.into_pipeline(Stage::WebhookDelivery))?;
        Ok(Delivery::DeadLettered {
            attempts: self.policy.max_attempts,
        })
    }
}

/// Consumer of the extracted-event queue that drives the dispatcher.
pub struct WebhookWorker {
    queue: Arc<dyn MessageQueue>,
    dispatcher: WebhookDispatcher,
    batch_size: usize,
}

impl WebhookWorker {
    pub fn new(queue: Arc<dyn MessageQueue>, dispatcher: WebhookDispatcher, batch_size: usize) -> Self {
        Self {
            queue,
            dispatcher,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_once(&self) -> Result<usize> {
        let messages = self
            .queue
            .consume(self.batch_size)
            .await
            .map_err(|e| e.into_pipeline(Stage::Event))?;
        let handled = messages.len();
        for message in messages {
            self.handle_message(&message).await?;
        }
        Ok(handled)
    }

    /// Every outcome, including dead-lettering, consumes the message.
    pub async fn handle_message(&self, message: &QueueMessage) -> Result<Delivery> {
        let delivery = match serde_json::from_value::<DocumentExtractedEvent>(message.body.clone()) {
            Ok(event) => self.dispatcher.dispatch(&event).await?,
            Err(e) => {
                let err = PipelineError::invalid_input(Stage::Event, format!("malformed extracted event: {e}"));
                self.dispatcher
                    .dlq
                    .send(&message.body, &err, FailureContext::default(), message.receive_count, 1)
                    .await
                    .map_err(|e| e.into_pipeline(Stage::Event))?;
                Delivery::DeadLettered { attempts: 0 }
            }
        };
        self.queue
            .delete(&message.receipt_handle)
            .await
            .map_err(|e| e.into_pipeline(Stage::Event))?;
        Ok(delivery)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid signing key: {0}")]
    SigningKey(String),
}
