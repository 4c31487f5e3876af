use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{DocumentStore, StoreError};
use crate::models::document::{DocumentRecord, DocumentStatus, DocumentType};
use crate::models::extraction::{ExtractionDetails, FieldMap};

const COLUMNS: &str = "document_id, verification_id, client_id, document_type, status, image_ref, \
     extracted_data, confidence, processing_time_ms, details, errors, idempotency_key, created_at, updated_at";

/// `documents` table access with runtime-checked queries.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn save(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (document_id, verification_id, client_id, document_type, status,
                                   image_ref, extracted_data, confidence, processing_time_ms, details,
                                   errors, idempotency_key, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.document_id)
        .bind(record.verification_id)
        .bind(&record.client_id)
        .bind(record.document_type.as_ref())
        .bind(record.status.as_ref())
        .bind(&record.image_ref)
        .bind(to_json(&record.extracted_data)?)
        .bind(record.confidence)
        .bind(record.processing_time_ms.map(|ms| ms as i64))
        .bind(to_json(&record.details)?)
        .bind(to_json(&record.errors)?)
        .bind(&record.idempotency_key)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(record.idempotency_key.clone()));
        }
        Ok(())
    }

    async fn get_by_id(&self, document_id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM documents WHERE document_id = $1"))
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM documents WHERE idempotency_key = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let replaceable: Vec<String> = record
            .status
            .may_replace()
            .iter()
            .map(|status| status.to_string())
            .collect();
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = $2,
                extracted_data = $3,
                confidence = $4,
                processing_time_ms = $5,
                details = $6,
                errors = $7,
                updated_at = $8
            WHERE document_id = $1 AND status = ANY($9)
            "#,
        )
        .bind(record.document_id)
        .bind(record.status.as_ref())
        .bind(to_json(&record.extracted_data)?)
        .bind(record.confidence)
        .bind(record.processing_time_ms.map(|ms| ms as i64))
        .bind(to_json(&record.details)?)
        .bind(to_json(&record.errors)?)
        .bind(record.updated_at)
        .bind(replaceable)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Nothing matched: either the record is gone or it has moved past this write.
        let stored: Option<String> = sqlx::query_scalar("SELECT status FROM documents WHERE document_id = $1")
            .bind(record.document_id)
            .fetch_optional(&self.pool)
            .await?;
        match stored {
            None => Err(StoreError::NotFound(record.document_id)),
            Some(stored) => Err(StoreError::StaleStatus {
                document_id: record.document_id,
                stored: DocumentStatus::from_str(&stored)
                    .map_err(|_| StoreError::Corrupt(format!("status {stored}")))?,
                attempted: record.status,
            }),
        }
    }

    async fn list(&self, client_id: Option<&str>, limit: usize) -> Result<Vec<DocumentRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM documents \
             WHERE ($1::text IS NULL OR client_id = $1) \
             ORDER BY created_at DESC, document_id DESC \
             LIMIT $2"
        ))
        .bind(client_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Option<serde_json::Value>) -> Result<Option<T>, StoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn record_from_row(row: &PgRow) -> Result<DocumentRecord, StoreError> {
    let document_type: String = row.try_get("document_type")?;
    let status: String = row.try_get("status")?;
    let processing_time_ms: Option<i64> = row.try_get("processing_time_ms")?;

    Ok(DocumentRecord {
        document_id: row.try_get("document_id")?,
        verification_id: row.try_get("verification_id")?,
        client_id: row.try_get("client_id")?,
        document_type: DocumentType::from_str(&document_type)
            .map_err(|_| StoreError::Corrupt(format!("document_type {document_type}")))?,
        status: DocumentStatus::from_str(&status)
            .map_err(|_| StoreError::Corrupt(format!("status {status}")))?,
        image_ref: row.try_get("image_ref")?,
        extracted_data: from_json::<FieldMap>(row.try_get("extracted_data")?)?,
        confidence: row.try_get("confidence")?,
        processing_time_ms: processing_time_ms.map(|ms| ms.max(0) as u64),
        details: from_json::<ExtractionDetails>(row.try_get("details")?)?,
        errors: from_json::<Vec<String>>(row.try_get("errors")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
