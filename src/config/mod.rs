use std::time::Duration;

use serde::Deserialize;

use crate::models::document::DocumentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Consumes one document-type queue and runs extraction.
    Extract,
    /// Consumes the extracted-event queue and delivers webhooks.
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string for the work queues
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// PostgreSQL connection string. Records live in memory when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_queue_dni")]
    pub queue_dni: String,

    #[serde(default = "default_queue_passport")]
    pub queue_passport: String,

    #[serde(default = "default_queue_license")]
    pub queue_license: String,

    /// Queue of `document.extracted.v1` events
    #[serde(default = "default_queue_extracted")]
    pub queue_extracted: String,

    #[serde(default = "default_worker_role")]
    pub worker_role: WorkerRole,

    /// Document type served by an extract worker
    #[serde(default = "default_worker_document_type")]
    pub worker_document_type: DocumentType,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deliveries before a transient failure is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Root directory for local image references
    #[serde(default = "default_image_root")]
    pub image_root: String,

    /// R2 bucket name. Images are read from `image_root` when unset.
    #[serde(default)]
    pub r2_bucket: Option<String>,

    #[serde(default)]
    pub r2_endpoint: Option<String>,

    #[serde(default)]
    pub r2_access_key: Option<String>,

    #[serde(default)]
    pub r2_secret_key: Option<String>,

    /// AES-256-GCM key for images at rest (base64-encoded, 32 bytes)
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Cloudflare account ID for Workers AI text recognition
    #[serde(default)]
    pub cf_account_id: Option<String>,

    #[serde(default)]
    pub cf_api_token: Option<String>,

    #[serde(default = "default_cf_model")]
    pub cf_model: String,

    #[serde(default = "default_recognition_timeout_secs")]
    pub recognition_timeout_secs: u64,

    /// Prometheus exporter bind address
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_dni() -> String {
    "queue-ocr-dni".to_string()
}

fn default_queue_passport() -> String {
    "queue-ocr-passport".to_string()
}

fn default_queue_license() -> String {
    "queue-ocr-license".to_string()
}

fn default_queue_extracted() -> String {
    "queue-extracted".to_string()
}

fn default_worker_role() -> WorkerRole {
    WorkerRole::Extract
}

fn default_worker_document_type() -> DocumentType {
    DocumentType::Dni
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    1
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_image_root() -> String {
    "./data/images".to_string()
}

fn default_cf_model() -> String {
    "@cf/llava-hf/llava-1.5-7b-hf".to_string()
}

fn default_recognition_timeout_secs() -> u64 {
    30
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn queue_routes(&self) -> QueueRoutes {
        QueueRoutes {
            dni: self.queue_dni.clone(),
            passport: self.queue_passport.clone(),
            license: self.queue_license.clone(),
        }
    }

    pub fn queue_for(&self, document_type: DocumentType) -> &str {
        match document_type {
            DocumentType::Dni => &self.queue_dni,
            DocumentType::Passport => &self.queue_passport,
            DocumentType::License => &self.queue_license,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// All four R2 settings, when present.
    pub fn r2(&self) -> Option<(&str, &str, &str, &str)> {
        Some((
            self.r2_bucket.as_deref()?,
            self.r2_endpoint.as_deref()?,
            self.r2_access_key.as_deref()?,
            self.r2_secret_key.as_deref()?,
        ))
    }
}

/// Work queue per document type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoutes {
    pub dni: String,
    pub passport: String,
    pub license: String,
}

impl QueueRoutes {
    pub fn queue_for(&self, document_type: DocumentType) -> &str {
        match document_type {
            DocumentType::Dni => &self.dni,
            DocumentType::Passport => &self.passport,
            DocumentType::License => &self.license,
        }
    }
}

impl Default for QueueRoutes {
    fn default() -> Self {
        Self {
            dni: default_queue_dni(),
            passport: default_queue_passport(),
            license: default_queue_license(),
        }
    }
}
