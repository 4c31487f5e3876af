//! Named message queues with visibility timeouts and receive counts.
//!
//! A consumed message stays invisible until it is deleted, made visible
//! again, or its claim expires; each delivery increments `receive_count`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Stage};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Dead-letter queue name for `queue`.
pub fn dlq_name(queue: &str) -> String {
    format!("{queue}-dlq")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: serde_json::Value,
    pub receive_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the new message id.
    async fn publish(&self, body: &serde_json::Value) -> Result<String, QueueError>;

    /// Claim up to `max` visible messages.
    async fn consume(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Release a claim early so the message can be redelivered.
    async fn make_visible(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Messages waiting to be claimed.
    async fn size(&self) -> Result<usize, QueueError>;
}

/// Hands out queue handles by name.
pub trait QueueFactory: Send + Sync {
    fn queue(&self, name: &str) -> Arc<dyn MessageQueue>;
}

/// Stored form shared by both backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    message_id: String,
    body: serde_json::Value,
    receive_count: u32,
}

impl Envelope {
    fn new(body: &serde_json::Value) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            body: body.clone(),
            receive_count: 0,
        }
    }

    fn claim(mut self) -> (String, Self, QueueMessage) {
        self.receive_count += 1;
        let receipt = Uuid::new_v4().to_string();
        let message = self.message(&receipt, self.receive_count);
        (receipt, self, message)
    }

    fn message(&self, receipt: &str, receive_count: u32) -> QueueMessage {
        QueueMessage {
            message_id: self.message_id.clone(),
            receipt_handle: receipt.to_string(),
            body: self.body.clone(),
            receive_count,
        }
    }
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<String, (Envelope, Instant)>,
}

/// Process-local queue for tests and single-binary runs.
pub struct MemoryQueue {
    name: String,
    visibility_timeout: Duration,
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_visibility_timeout(name, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Claimed but not yet deleted.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: &serde_json::Value) -> Result<String, QueueError> {
        let envelope = Envelope::new(body);
        let id = envelope.message_id.clone();
        self.lock().ready.push_back(envelope);
        Ok(id)
    }

    async fn consume(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((envelope, _)) = state.in_flight.remove(&receipt) {
                state.ready.push_back(envelope);
            }
        }

        let mut claimed = Vec::new();
        while claimed.len() < max {
            let Some(envelope) = state.ready.pop_front() else {
                break;
            };
            let (receipt, envelope, message) = envelope.claim();
            state.in_flight.insert(receipt, (envelope, now + self.visibility_timeout));
            claimed.push(message);
        }
        Ok(claimed)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.lock()
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))
    }

    async fn make_visible(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let (envelope, _) = state
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;
        state.ready.push_front(envelope);
        Ok(())
    }

    async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.lock().ready.len())
    }
}

/// Memory queues created on first use and shared by name.
#[derive(Default)]
pub struct MemoryQueueFactory {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryQueueFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle, for inspecting in-flight counts in tests.
    pub fn memory_queue(&self, name: &str) -> Arc<MemoryQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone()
    }
}

impl QueueFactory for MemoryQueueFactory {
    fn queue(&self, name: &str) -> Arc<dyn MessageQueue> {
        self.memory_queue(name)
    }
}

// ── Redis ───────────────────────────────────────────────────────────

/// Pops one ready envelope and records the claim in the same script run.
///
/// KEYS: ready list, in-flight hash, deadlines zset, receive-count hash.
/// ARGV: receipt handle, deadline in unix millis.
/// Returns `{envelope, receive_count}` or nil when the list is empty.
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local payload = redis.call('RPOP', KEYS[1])
        if not payload then
            return false
        end
        local id = cjson.decode(payload)['message_id']
        local count = redis.call('HINCRBY', KEYS[4], id, 1)
        redis.call('HSET', KEYS[2], ARGV[1], payload)
        redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
        return {payload, count}
        "#,
    )
});

/// Drops a claim and its receive count. Returns 0 for an unknown receipt.
///
/// KEYS: in-flight hash, deadlines zset, receive-count hash. ARGV: receipt handle.
static DELETE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local payload = redis.call('HGET', KEYS[1], ARGV[1])
        if not payload then
            return 0
        end
        local id = cjson.decode(payload)['message_id']
        redis.call('HDEL', KEYS[1], ARGV[1])
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[3], id)
        return 1
        "#,
    )
});

/// Redis-backed queue: a list of ready envelopes, a hash of claimed
/// envelopes by receipt, a sorted set of claim deadlines and a hash of
/// receive counts by message id. Claims and deletes run as Lua scripts so a
/// dropped connection never loses a message between pop and bookkeeping.
pub struct RedisQueue {
    client: redis::Client,
    name: String,
    visibility_timeout: Duration,
}

impl RedisQueue {
    pub fn new(client: redis::Client, name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            client,
            name: name.into(),
            visibility_timeout,
        }
    }

    fn ready_key(&self) -> String {
        format!("kyc:queue:{}", self.name)
    }

    fn in_flight_key(&self) -> String {
        format!("kyc:queue:{}:inflight", self.name)
    }

    fn deadlines_key(&self) -> String {
        format!("kyc:queue:{}:deadlines", self.name)
    }

    fn receives_key(&self) -> String {
        format!("kyc:queue:{}:receives", self.name)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Move claims whose deadline has passed back onto the ready list.
    async fn requeue_expired(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = conn.zrangebyscore(self.deadlines_key(), 0, now).await?;
        for receipt in expired {
            let stored: Option<String> = conn.hget(self.in_flight_key(), &receipt).await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .hdel(self.in_flight_key(), &receipt)
                .zrem(self.deadlines_key(), &receipt);
            if let Some(envelope) = stored {
                pipe.rpush(self.ready_key(), envelope);
            }
            pipe.query_async::<()>(conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: &serde_json::Value) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let envelope = Envelope::new(body);
        let payload = serde_json::to_string(&envelope)?;
        conn.lpush::<_, _, ()>(self.ready_key(), payload).await?;
        Ok(envelope.message_id)
    }

    async fn consume(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.connection().await?;
        self.requeue_expired(&mut conn).await?;

        let mut claimed = Vec::new();
        while claimed.len() < max {
            let receipt = Uuid::new_v4().to_string();
            let deadline = Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
            let popped: Option<(String, u32)> = CLAIM_SCRIPT
                .key(self.ready_key())
                .key(self.in_flight_key())
                .key(self.deadlines_key())
                .key(self.receives_key())
                .arg(&receipt)
                .arg(deadline)
                .invoke_async(&mut conn)
                .await?;
            let Some((payload, receive_count)) = popped else {
                break;
            };
            let envelope: Envelope = serde_json::from_str(&payload)?;
            claimed.push(envelope.message(&receipt, receive_count));
        }
        Ok(claimed)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = DELETE_SCRIPT
            .key(self.in_flight_key())
            .key(self.deadlines_key())
            .key(self.receives_key())
            .arg(receipt_handle)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(QueueError::UnknownReceipt(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn make_visible(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let stored: Option<String> = conn.hget(self.in_flight_key(), receipt_handle).await?;
        let envelope = stored.ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;
        redis::pipe()
            .atomic()
            .hdel(self.in_flight_key(), receipt_handle)
            .zrem(self.deadlines_key(), receipt_handle)
            .rpush(self.ready_key(), envelope)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn size(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(self.ready_key()).await?)
    }
}

pub struct RedisQueueFactory {
    client: redis::Client,
    visibility_timeout: Duration,
}

impl RedisQueueFactory {
    pub fn new(redis_url: &str, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            visibility_timeout,
        })
    }

    /// PING, for startup checks.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

impl QueueFactory for RedisQueueFactory {
    fn queue(&self, name: &str) -> Arc<dyn MessageQueue> {
        Arc::new(RedisQueue::new(self.client.clone(), name, self.visibility_timeout))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown receipt handle: {0}")]
    UnknownReceipt(String),
}

impl QueueError {
    pub fn into_pipeline(self, stage: Stage) -> PipelineError {
        match self {
            QueueError::Serialize(_) => PipelineError::invalid_input(stage, self),
            _ => PipelineError::transient(stage, self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_consume_hides_until_deleted() {
        let queue = MemoryQueue::new("queue-ocr-dni");
        queue.publish(&json!({"n": 1})).await.unwrap();
        queue.publish(&json!({"n": 2})).await.unwrap();

        let first = queue.consume(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, json!({"n": 1}));
        assert_eq!(first[0].receive_count, 1);
        assert_eq!(queue.size().await.unwrap(), 1);

        queue.delete(&first[0].receipt_handle).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.delete(&first[0].receipt_handle).await.is_err());
    }

    #[tokio::test]
    async fn test_make_visible_increments_receive_count() {
        let queue = MemoryQueue::new("q");
        let id = queue.publish(&json!("body")).await.unwrap();
        for expected in 1..=3 {
            let claimed = queue.consume(10).await.unwrap();
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].message_id, id);
            assert_eq!(claimed[0].receive_count, expected);
            queue.make_visible(&claimed[0].receipt_handle).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_expired_claims_are_redelivered() {
        let queue = MemoryQueue::with_visibility_timeout("q", Duration::ZERO);
        queue.publish(&json!(1)).await.unwrap();
        let first = queue.consume(1).await.unwrap();
        let second = queue.consume(1).await.unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);
    }

    #[test]
    fn test_factory_shares_queues_by_name() {
        let factory = MemoryQueueFactory::new();
        let a = factory.memory_queue("queue-extracted");
        let b = factory.memory_queue("queue-extracted");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dlq_name(a.name()), "queue-extracted-dlq");
    }
}
