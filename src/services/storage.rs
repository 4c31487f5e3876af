use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

use crate::error::{PipelineError, Stage};
use crate::services::encryption::{EncryptionError, EncryptionService};

/// Resolves `image_ref`s to image bytes.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store `data` under `key` and return the reference to put on the work item.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError>;

    async fn fetch(&self, image_ref: &str) -> Result<Vec<u8>, StorageError>;
}

// ── Local filesystem ────────────────────────────────────────────────

/// Images under a root directory; references are paths relative to it.
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, image_ref: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(image_ref);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if image_ref.is_empty() || escapes {
            return Err(StorageError::InvalidRef(image_ref.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(key.to_string())
    }

    async fn fetch(&self, image_ref: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(image_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(image_ref.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Cloudflare R2 ───────────────────────────────────────────────────

/// R2 (S3-compatible) object storage, optionally encrypting objects at rest.
pub struct R2ImageStore {
    bucket: Box<Bucket>,
    encryption: Option<Arc<EncryptionService>>,
}

impl R2ImageStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        encryption: Option<Arc<EncryptionService>>,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket =
            Bucket::new(bucket_name, region, credentials).map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket, encryption })
    }
}

#[async_trait]
impl ImageStore for R2ImageStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let sealed;
        let (body, content_type) = match &self.encryption {
            Some(encryption) => {
                sealed = encryption.encrypt(data)?;
                (sealed.as_slice(), "application/octet-stream")
            }
            None => (data, content_type),
        };
        self.bucket
            .put_object_with_content_type(key, body, content_type)
            .await?;
        Ok(key.to_string())
    }

    async fn fetch(&self, image_ref: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(image_ref).await?;
        if response.status_code() == 404 {
            return Err(StorageError::NotFound(image_ref.to_string()));
        }
        let bytes = response.to_vec();
        match &self.encryption {
            Some(encryption) => Ok(encryption.decrypt(&bytes)?),
            None => Ok(bytes),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Invalid image reference: {0}")]
    InvalidRef(String),

    #[error("Image decryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn into_pipeline(self, stage: Stage) -> PipelineError {
        match self {
            StorageError::S3(_) | StorageError::Io(_) => PipelineError::transient(stage, self),
            _ => PipelineError::invalid_input(stage, self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("id-doc-pipeline-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let store = LocalImageStore::new(temp_root("roundtrip"));
        let image_ref = store.put("acme/front.jpg", b"jpeg bytes", "image/jpeg").await.unwrap();
        assert_eq!(image_ref, "acme/front.jpg");
        assert_eq!(store.fetch(&image_ref).await.unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_local_missing_is_not_found() {
        let store = LocalImageStore::new(temp_root("missing"));
        let err = store.fetch("nope.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!err.into_pipeline(Stage::Fetch).is_retryable());
    }

    #[tokio::test]
    async fn test_local_rejects_escaping_refs() {
        let store = LocalImageStore::new(temp_root("escape"));
        assert!(matches!(store.fetch("../etc/passwd").await, Err(StorageError::InvalidRef(_))));
        assert!(matches!(store.fetch("/etc/passwd").await, Err(StorageError::InvalidRef(_))));
    }
}
