//! Shared wiring for integration tests: in-memory queues and store, canned
//! recognizers and a scripted webhook transport.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use id_doc_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db::MemoryDocumentStore,
    models::document::DocumentType,
    services::{
        ingest::UploadRequest,
        processor::DocumentProcessor,
        queue::{dlq_name, MemoryQueue, MemoryQueueFactory},
        recognition::{FixedBarcodeDecoder, FixedTextRecognizer},
        storage::LocalImageStore,
        webhook::{WebhookError, WebhookRequest, WebhookTransport},
    },
};
use image::{ImageFormat, Rgb, RgbImage};
use uuid::Uuid;

pub const DNI_PAYLOAD: &str = "00123456789@GONZALEZ@MARIA LAURA@F@30111222@A@15031985@20062017";
pub const PASSPORT_PAGE: &str = "PASAPORTE\nAAB123456\nAPELLIDO / SURNAME\nGONZALEZ";

/// Card-sized PNG with a photo block and printed lines. `seed` varies the pixels.
pub fn card_png(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(320, 200, |x, y| {
        if (40..120).contains(&x) && (40..150).contains(&y) {
            Rgb([200, 150, seed])
        } else if y % 20 < 3 {
            Rgb([30, 30, 30])
        } else {
            Rgb([235, 230, 220])
        }
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn default_config() -> AppConfig {
    envy::from_iter(Vec::<(String, String)>::new()).unwrap()
}

pub struct Harness {
    pub state: AppState,
    pub queues: Arc<MemoryQueueFactory>,
    pub store: Arc<MemoryDocumentStore>,
}

impl Harness {
    pub fn new(pdf417: Option<&str>, document: Option<&str>, mrz: Option<&str>) -> Self {
        let queues = Arc::new(MemoryQueueFactory::new());
        let store = Arc::new(MemoryDocumentStore::new());
        let root = std::env::temp_dir().join(format!("id-doc-it-{}", Uuid::new_v4()));
        let processor = DocumentProcessor::new(
            Arc::new(FixedBarcodeDecoder::new(pdf417)),
            Arc::new(FixedTextRecognizer::new(document, mrz)),
        );
        let state = AppState::new(
            default_config(),
            store.clone(),
            Arc::new(LocalImageStore::new(root)),
            queues.clone(),
            processor,
        );
        Self { state, queues, store }
    }

    pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues.memory_queue(name)
    }

    pub fn work_queue(&self, document_type: DocumentType) -> Arc<MemoryQueue> {
        self.queue(self.state.config.queue_for(document_type))
    }

    pub fn work_dlq(&self, document_type: DocumentType) -> Arc<MemoryQueue> {
        self.queue(&dlq_name(self.state.config.queue_for(document_type)))
    }

    pub fn extracted_queue(&self) -> Arc<MemoryQueue> {
        self.queue(&self.state.config.queue_extracted)
    }
}

pub fn upload(document_type: DocumentType, image: Vec<u8>) -> UploadRequest {
    UploadRequest {
        client_id: "acme".to_string(),
        document_type: Some(document_type),
        image,
        content_type: Some("image/png".to_string()),
        ..Default::default()
    }
}

/// Transport answering with a scripted list of statuses; the last one repeats.
pub struct FakeTransport {
    statuses: Vec<u16>,
    requests: Mutex<Vec<WebhookRequest>>,
}

impl FakeTransport {
    pub fn new(statuses: Vec<u16>) -> Self {
        Self {
            statuses,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookTransport for FakeTransport {
    async fn post(&self, request: &WebhookRequest) -> Result<u16, WebhookError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let index = (requests.len() - 1).min(self.statuses.len().saturating_sub(1));
        Ok(self.statuses.get(index).copied().unwrap_or(200))
    }
}

pub fn header<'a>(request: &'a WebhookRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.as_str())
}
