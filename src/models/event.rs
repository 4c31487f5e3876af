use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, Stage};
use crate::models::analysis::{Analysis, AuthenticityReport, LivenessReport};
use crate::models::document::DocumentType;
use crate::models::extraction::{FieldMap, Provenance};

pub const DOCUMENT_UPLOADED_V1: &str = "document.uploaded.v1";
pub const DOCUMENT_EXTRACTED_V1: &str = "document.extracted.v1";

fn uploaded_event_name() -> String {
    DOCUMENT_UPLOADED_V1.to_string()
}

fn extracted_event_name() -> String {
    DOCUMENT_EXTRACTED_V1.to_string()
}

fn is_uploaded_event(value: &String, _ctx: &()) -> garde::Result {
    if value == DOCUMENT_UPLOADED_V1 {
        Ok(())
    } else {
        Err(garde::Error::new(format!("unexpected event name {value}")))
    }
}

fn is_http_url(value: &String, _ctx: &()) -> garde::Result {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        Err(garde::Error::new("webhook url must be http(s)"))
    }
}

/// Work item published by ingestion and consumed by the extraction worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DocumentUploadedEvent {
    #[serde(default = "uploaded_event_name")]
    #[garde(custom(is_uploaded_event))]
    pub event: String,

    #[garde(skip)]
    pub document_id: Uuid,

    #[garde(skip)]
    pub verification_id: Uuid,

    #[garde(length(min = 1, max = 128))]
    pub client_id: String,

    #[garde(skip)]
    pub document_type: DocumentType,

    #[garde(length(min = 1, max = 1024))]
    pub image_ref: String,

    #[serde(default)]
    #[garde(skip)]
    pub check_authenticity: bool,

    #[serde(default)]
    #[garde(skip)]
    pub check_document_liveness: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub frames: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(inner(custom(is_http_url)))]
    pub webhook_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub webhook_secret: Option<String>,

    #[serde(default = "Utc::now")]
    #[garde(skip)]
    pub timestamp: DateTime<Utc>,
}

/// Result event published after a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentExtractedEvent {
    #[serde(default = "extracted_event_name")]
    pub event: String,
    pub document_id: Uuid,
    pub verification_id: Uuid,
    pub document_type: DocumentType,
    pub extracted_data: FieldMap,
    pub confidence: f64,
    /// Cross-check flags; a `discrepancy` means the sources disagreed on the document number.
    #[serde(default)]
    pub provenance: Provenance,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticity_result: Option<Analysis<AuthenticityReport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_result: Option<Analysis<LivenessReport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl DocumentExtractedEvent {
    /// Body delivered to the client callback. Routing data and the secret stay behind.
    pub fn webhook_payload(&self) -> WebhookPayload {
        WebhookPayload {
            event: self.event.clone(),
            document_id: self.document_id,
            verification_id: self.verification_id,
            document_type: self.document_type,
            extracted_data: self.extracted_data.clone(),
            confidence: self.confidence,
            provenance: self.provenance.clone(),
            processing_time_ms: self.processing_time_ms,
            authenticity_result: self.authenticity_result.clone(),
            liveness_result: self.liveness_result.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub document_id: Uuid,
    pub verification_id: Uuid,
    pub document_type: DocumentType,
    pub extracted_data: FieldMap,
    pub confidence: f64,
    #[serde(default)]
    pub provenance: Provenance,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticity_result: Option<Analysis<AuthenticityReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_result: Option<Analysis<LivenessReport>>,
    pub timestamp: DateTime<Utc>,
}

/// Dead-letter entry: the original body plus failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub stage: Stage,
    pub worker: String,
    pub document_id: Option<Uuid>,
    pub verification_id: Option<Uuid>,
    pub attempt_count: u32,
    pub max_receive_count: u32,
    pub is_final_attempt: bool,
    pub failed_at: DateTime<Utc>,
    pub original_message: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> DocumentUploadedEvent {
        DocumentUploadedEvent {
            event: DOCUMENT_UPLOADED_V1.to_string(),
            document_id: Uuid::now_v7(),
            verification_id: Uuid::now_v7(),
            client_id: "acme".to_string(),
            document_type: DocumentType::Dni,
            image_ref: "uploads/front.jpg".to_string(),
            check_authenticity: true,
            check_document_liveness: false,
            frames: None,
            webhook_url: Some("https://hooks.example.com/kyc".to_string()),
            webhook_secret: Some("s3cret".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_valid_event_passes() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn test_empty_client_rejected() {
        let mut event = sample_event();
        event.client_id.clear();
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_non_http_webhook_rejected() {
        let mut event = sample_event();
        event.webhook_url = Some("ftp://example.com".to_string());
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let body = serde_json::json!({
            "document_id": Uuid::now_v7(),
            "verification_id": Uuid::now_v7(),
            "client_id": "acme",
            "document_type": "passport",
            "image_ref": "uploads/p.png",
        });
        let event: DocumentUploadedEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.event, DOCUMENT_UPLOADED_V1);
        assert!(!event.check_authenticity);
        assert!(event.frames.is_none());
    }

    #[test]
    fn test_webhook_payload_omits_secret() {
        let event = DocumentExtractedEvent {
            event: DOCUMENT_EXTRACTED_V1.to_string(),
            document_id: Uuid::now_v7(),
            verification_id: Uuid::now_v7(),
            document_type: DocumentType::Dni,
            extracted_data: FieldMap::new(),
            confidence: 0.9,
            provenance: Provenance::default(),
            processing_time_ms: 10,
            source: "pdf417".to_string(),
            errors: None,
            authenticity_result: None,
            liveness_result: None,
            webhook_url: Some("https://example.com".to_string()),
            webhook_secret: Some("top-secret".to_string()),
            timestamp: Utc::now(),
        };
        let body = serde_json::to_string(&event.webhook_payload()).unwrap();
        assert!(!body.contains("top-secret"));
        assert!(!body.contains("webhook_url"));
    }
}
