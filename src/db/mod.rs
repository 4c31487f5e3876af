use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, Stage};
use crate::models::document::{DocumentRecord, DocumentStatus};

pub mod queries;

pub use queries::PgDocumentStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persistence for document records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new record. Fails with `Duplicate` when the idempotency key is taken.
    async fn save(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    async fn get_by_id(&self, document_id: Uuid) -> Result<Option<DocumentRecord>, StoreError>;

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<DocumentRecord>, StoreError>;

    /// Overwrite status, results and errors of an existing record.
    ///
    /// Fails with `StaleStatus` when the stored status is not one that
    /// `record.status` may replace, so a slow writer never moves a document backwards.
    async fn update(&self, record: &DocumentRecord) -> Result<(), StoreError>;

    /// Newest first, optionally for one client.
    async fn list(&self, client_id: Option<&str>, limit: usize) -> Result<Vec<DocumentRecord>, StoreError>;
}

/// In-process store used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryDocumentStore {
    records: RwLock<HashMap<Uuid, DocumentRecord>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn save(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records
            .values()
            .any(|r| r.idempotency_key == record.idempotency_key)
        {
            return Err(StoreError::Duplicate(record.idempotency_key.clone()));
        }
        records.insert(record.document_id, record.clone());
        Ok(())
    }

    async fn get_by_id(&self, document_id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.records.read().await.get(&document_id).cloned())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.idempotency_key == key)
            .cloned())
    }

    async fn update(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.document_id) {
            Some(existing) if record.status.may_replace().contains(&existing.status) => {
                *existing = record.clone();
                Ok(())
            }
            Some(existing) => Err(StoreError::StaleStatus {
                document_id: record.document_id,
                stored: existing.status,
                attempted: record.status,
            }),
            None => Err(StoreError::NotFound(record.document_id)),
        }
    }

    async fn list(&self, client_id: Option<&str>, limit: usize) -> Result<Vec<DocumentRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matching: Vec<DocumentRecord> = records
            .values()
            .filter(|r| client_id.map_or(true, |c| r.client_id == c))
            .cloned()
            .collect();
        // v7 ids sort by creation time.
        matching.sort_by(|a, b| b.document_id.cmp(&a.document_id));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Document not found: {0}")]
    NotFound(Uuid),

    #[error("Idempotency key already used: {0}")]
    Duplicate(String),

    #[error("Document {document_id} is already {stored}, refusing to write {attempted}")]
    StaleStatus {
        document_id: Uuid,
        stored: DocumentStatus,
        attempted: DocumentStatus,
    },

    #[error("Stored record is unreadable: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn into_pipeline(self, stage: Stage) -> PipelineError {
        match self {
            StoreError::Database(_) => PipelineError::transient(stage, self),
            _ => PipelineError::invalid_input(stage, self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::DocumentType;
    use crate::models::extraction::{ExtractionDetails, FieldMap};

    #[tokio::test]
    async fn test_save_and_lookup() {
        let store = MemoryDocumentStore::new();
        let record = DocumentRecord::new("acme", DocumentType::Dni, "uploads/a.jpg", "key-a", None);
        store.save(&record).await.unwrap();

        assert_eq!(store.get_by_id(record.document_id).await.unwrap(), Some(record.clone()));
        assert_eq!(
            store.get_by_idempotency_key("key-a").await.unwrap().map(|r| r.document_id),
            Some(record.document_id)
        );
        assert!(matches!(store.save(&record).await, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = MemoryDocumentStore::new();
        let mut record = DocumentRecord::new("acme", DocumentType::Passport, "p.png", "key-p", None);
        assert!(matches!(store.update(&record).await, Err(StoreError::NotFound(_))));

        store.save(&record).await.unwrap();
        record.mark_queued().unwrap();
        store.update(&record).await.unwrap();
        let stored = store.get_by_id(record.document_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_never_moves_status_backwards() {
        let store = MemoryDocumentStore::new();
        let mut record = DocumentRecord::new("acme", DocumentType::Dni, "d.png", "key-d", None);
        store.save(&record).await.unwrap();
        let stale = {
            let mut copy = record.clone();
            copy.mark_queued().unwrap();
            copy
        };

        record.mark_queued().unwrap();
        record.mark_processing().unwrap();
        store.update(&record).await.unwrap();
        record
            .mark_extracted(FieldMap::new(), 0.9, 5, ExtractionDetails::default())
            .unwrap();
        store.update(&record).await.unwrap();

        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::StaleStatus { stored: DocumentStatus::Extracted, attempted: DocumentStatus::Queued, .. }
        ));
        let stored = store.get_by_id(record.document_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DocumentStatus::Extracted);
        assert!(stored.extracted_data.is_some());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = MemoryDocumentStore::new();
        let first = DocumentRecord::new("acme", DocumentType::Dni, "1.jpg", "k1", None);
        let other = DocumentRecord::new("globex", DocumentType::Dni, "2.jpg", "k2", None);
        let second = DocumentRecord::new("acme", DocumentType::License, "3.jpg", "k3", None);
        for r in [&first, &other, &second] {
            store.save(r).await.unwrap();
        }
        let listed = store.list(Some("acme"), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].document_id, second.document_id);
        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);
    }
}
