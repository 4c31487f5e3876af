use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::extraction::{ExtractionDetails, FieldMap};

/// Declared type of an uploaded identity document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentType {
    Dni,
    Passport,
    License,
}

/// Lifecycle status of a document record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Queued,
    Processing,
    Extracted,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Extracted | DocumentStatus::Failed)
    }

    pub const ALL: [DocumentStatus; 5] = [
        DocumentStatus::Pending,
        DocumentStatus::Queued,
        DocumentStatus::Processing,
        DocumentStatus::Extracted,
        DocumentStatus::Failed,
    ];

    /// Stored statuses a write of `self` may replace: itself, or any status
    /// that reaches it through the lifecycle graph.
    pub fn may_replace(self) -> Vec<DocumentStatus> {
        Self::ALL
            .into_iter()
            .filter(|stored| *stored == self || stored.leads_to(self))
            .collect()
    }

    /// `target` is reachable in one or more forward steps.
    fn leads_to(self, target: DocumentStatus) -> bool {
        self.can_transition_to(target)
            || Self::ALL
                .into_iter()
                .filter(|next| *next != self && self.can_transition_to(*next))
                .any(|next| next.leads_to(target))
    }

    /// Allowed edges of the lifecycle graph.
    ///
    /// `processing -> processing` covers redelivery after an expired claim.
    /// `pending`/`queued` may fail directly when enqueueing or event validation fails.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Extracted)
                | (Processing, Failed)
        )
    }
}

/// One uploaded image tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub document_id: Uuid,
    pub verification_id: Uuid,
    pub client_id: String,
    pub document_type: DocumentType,
    pub status: DocumentStatus,
    pub image_ref: String,
    pub extracted_data: Option<FieldMap>,
    pub confidence: Option<f64>,
    pub processing_time_ms: Option<u64>,
    pub details: Option<ExtractionDetails>,
    pub errors: Option<Vec<String>>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// New `pending` record with a time-ordered id.
    pub fn new(
        client_id: impl Into<String>,
        document_type: DocumentType,
        image_ref: impl Into<String>,
        idempotency_key: impl Into<String>,
        verification_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            document_id: Uuid::now_v7(),
            verification_id: verification_id.unwrap_or_else(Uuid::now_v7),
            client_id: client_id.into(),
            document_type,
            status: DocumentStatus::Pending,
            image_ref: image_ref.into(),
            extracted_data: None,
            confidence: None,
            processing_time_ms: None,
            details: None,
            errors: None,
            idempotency_key: idempotency_key.into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: DocumentStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                document_id: self.document_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_queued(&mut self) -> Result<(), TransitionError> {
        self.transition(DocumentStatus::Queued)
    }

    pub fn mark_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(DocumentStatus::Processing)
    }

    pub fn mark_extracted(
        &mut self,
        extracted_data: FieldMap,
        confidence: f64,
        processing_time_ms: u64,
        details: ExtractionDetails,
    ) -> Result<(), TransitionError> {
        self.transition(DocumentStatus::Extracted)?;
        self.extracted_data = Some(extracted_data);
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self.processing_time_ms = Some(processing_time_ms);
        self.details = Some(details);
        self.errors = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, errors: Vec<String>) -> Result<(), TransitionError> {
        self.transition(DocumentStatus::Failed)?;
        self.extracted_data = None;
        self.confidence = None;
        self.details = None;
        self.errors = Some(errors);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("document {document_id}: invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub document_id: Uuid,
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> DocumentRecord {
        DocumentRecord::new("client-1", DocumentType::Dni, "uploads/a.jpg", "key-1", None)
    }

    fn sample_fields() -> FieldMap {
        FieldMap::from([("numero_documento".to_string(), "30111222".to_string())])
    }

    #[test]
    fn test_happy_path_sequence() {
        let mut record = sample_record();
        assert_eq!(record.status, DocumentStatus::Pending);
        record.mark_queued().unwrap();
        record.mark_processing().unwrap();
        record.mark_extracted(sample_fields(), 0.9, 120, ExtractionDetails::default()).unwrap();

        assert_eq!(record.status, DocumentStatus::Extracted);
        assert_eq!(record.confidence, Some(0.9));
        assert!(record.errors.is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut record = sample_record();
        record.mark_queued().unwrap();
        record.mark_processing().unwrap();
        record.mark_failed(vec!["boom".into()]).unwrap();

        assert!(record.mark_processing().is_err());
        assert!(record.mark_queued().is_err());
        assert!(record.mark_extracted(sample_fields(), 0.5, 1, ExtractionDetails::default()).is_err());
        assert_eq!(record.status, DocumentStatus::Failed);
        assert!(record.extracted_data.is_none());
        assert!(record.confidence.is_none());
    }

    #[test]
    fn test_no_backward_transitions() {
        use DocumentStatus::*;
        let order = [Pending, Queued, Processing, Extracted, Failed];
        for (i, from) in order.iter().enumerate() {
            for to in &order[..i.min(3)] {
                assert!(
                    !from.can_transition_to(*to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_may_replace_never_includes_later_statuses() {
        use DocumentStatus::*;
        assert_eq!(Queued.may_replace(), vec![Pending, Queued]);
        assert_eq!(Processing.may_replace(), vec![Pending, Queued, Processing]);
        assert_eq!(Extracted.may_replace(), vec![Pending, Queued, Processing, Extracted]);
        assert!(!Queued.may_replace().contains(&Extracted));
        assert!(!Processing.may_replace().contains(&Failed));
        assert!(!Failed.may_replace().contains(&Extracted));
    }

    #[test]
    fn test_redelivery_reenters_processing() {
        let mut record = sample_record();
        record.mark_queued().unwrap();
        record.mark_processing().unwrap();
        assert!(record.mark_processing().is_ok());
    }

    #[test]
    fn test_pending_cannot_skip_queue() {
        let mut record = sample_record();
        let err = record.mark_processing().unwrap_err();
        assert_eq!(err.from, DocumentStatus::Pending);
        assert_eq!(err.to, DocumentStatus::Processing);
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(DocumentStatus::from_str("extracted").unwrap(), DocumentStatus::Extracted);
        assert_eq!(DocumentType::License.to_string(), "license");
    }
}
