use id_doc_pipeline::{
    config::AppConfig,
    db::{self, DocumentStore, PgDocumentStore},
    models::document::{DocumentRecord, DocumentType},
    services::queue::{QueueFactory, RedisQueueFactory},
};
use serde_json::json;
use uuid::Uuid;

/// Backing services round trip: Postgres records and Redis queues.
///
/// Requires DATABASE_URL and REDIS_URL pointing at running instances.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_backing_services() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let database_url = config.database_url.as_deref().expect("DATABASE_URL must be set");

    let pool = db::init_pool(database_url).await.expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    let store = PgDocumentStore::new(pool);

    let key = format!("it-{}", Uuid::new_v4());
    let mut record = DocumentRecord::new("it-client", DocumentType::Dni, "it/front.img", key.clone(), None);
    store.save(&record).await.expect("Failed to save record");
    assert!(store.save(&record).await.is_err(), "idempotency key must be unique");

    record.mark_queued().unwrap();
    store.update(&record).await.expect("Failed to update record");
    let loaded = store
        .get_by_idempotency_key(&key)
        .await
        .expect("Failed to query record")
        .expect("Record missing");
    assert_eq!(loaded.document_id, record.document_id);
    assert_eq!(loaded.status, record.status);

    // A write from an earlier status is refused once the row has moved on.
    let stale = loaded.clone();
    record.mark_processing().unwrap();
    store.update(&record).await.expect("Failed to claim record");
    assert!(matches!(
        store.update(&stale).await,
        Err(db::StoreError::StaleStatus { .. })
    ));

    let queues = RedisQueueFactory::new(&config.redis_url, config.visibility_timeout())
        .expect("Failed to create queue client");
    queues.health_check().await.expect("Redis unreachable");
    let queue = queues.queue(&format!("it-{}", Uuid::new_v4()));

    queue.publish(&json!({"document_id": record.document_id})).await.unwrap();
    let claimed = queue.consume(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].receive_count, 1);

    queue.make_visible(&claimed[0].receipt_handle).await.unwrap();
    let again = queue.consume(1).await.unwrap();
    assert_eq!(again[0].receive_count, 2);
    queue.delete(&again[0].receipt_handle).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 0);
    assert!(queue.delete(&again[0].receipt_handle).await.is_err());

    // Claims pop and record in one step; every published message comes back exactly once.
    for n in 0..5 {
        queue.publish(&json!({ "n": n })).await.unwrap();
    }
    let batch = queue.consume(10).await.unwrap();
    assert_eq!(batch.len(), 5);
    assert!(batch.iter().all(|m| m.receive_count == 1));
    for message in &batch {
        queue.delete(&message.receipt_handle).await.unwrap();
    }
    assert!(queue.consume(10).await.unwrap().is_empty());
}
