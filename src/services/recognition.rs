use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{GrayImage, ImageFormat, RgbImage};
use reqwest::Client;
use rxing::BarcodeFormat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Stage};

/// Decoded symbol from a barcode reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBarcode {
    pub symbology: String,
    pub payload: Vec<u8>,
}

impl DecodedBarcode {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// What the text recognizer is looking at; changes the prompt, not the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextHint {
    Document,
    Mrz,
}

#[async_trait]
pub trait BarcodeDecoder: Send + Sync {
    /// `Ok(None)` when no PDF417 symbol is found.
    async fn decode_pdf417(&self, image: &GrayImage) -> Result<Option<DecodedBarcode>, RecognitionError>;
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &RgbImage, hint: TextHint) -> Result<String, RecognitionError>;
}

// ── rxing PDF417 ────────────────────────────────────────────────────

/// Local PDF417 reader. Decoding is CPU-bound and runs on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct RxingBarcodeDecoder;

impl RxingBarcodeDecoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BarcodeDecoder for RxingBarcodeDecoder {
    async fn decode_pdf417(&self, image: &GrayImage) -> Result<Option<DecodedBarcode>, RecognitionError> {
        let (width, height) = image.dimensions();
        let luma = image.as_raw().clone();
        let decoded = tokio::task::spawn_blocking(move || {
            rxing::helpers::detect_in_luma(luma, width, height, Some(BarcodeFormat::PDF_417))
        })
        .await
        .map_err(|e| RecognitionError::Task(e.to_string()))?;

        match decoded {
            Ok(result) => Ok(Some(DecodedBarcode {
                symbology: "pdf417".to_string(),
                payload: result.getText().as_bytes().to_vec(),
            })),
            Err(e) => {
                debug!(error = ?e, "no PDF417 symbol decoded");
                Ok(None)
            }
        }
    }
}

// ── Workers AI ──────────────────────────────────────────────────────

const DOCUMENT_PROMPT: &str = concat!(
    "Transcribe all printed text on this identity document exactly as it appears, ",
    "line by line, including labels such as APELLIDO / SURNAME and dates. ",
    "Return only the transcription."
);

const MRZ_PROMPT: &str = concat!(
    "Transcribe the machine readable zone in this image exactly, one line per row, ",
    "using only A-Z, 0-9 and the < filler character. Return only the lines."
);

/// Client for Cloudflare Workers AI image-to-text.
pub struct WorkersAiRecognizer {
    http: Client,
    account_id: String,
    api_token: String,
    model: String,
}

#[derive(Serialize)]
struct LlavaRequest<'a> {
    image: String,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiRecognizer {
    pub fn new(account_id: String, api_token: String, model: String, timeout: Duration) -> Result<Self, RecognitionError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            account_id,
            api_token,
            model,
        })
    }
}

#[async_trait]
impl TextRecognizer for WorkersAiRecognizer {
    async fn recognize(&self, image: &RgbImage, hint: TextHint) -> Result<String, RecognitionError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, self.model
        );

        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;

        let body = LlavaRequest {
            image: base64::engine::general_purpose::STANDARD.encode(png.into_inner()),
            prompt: match hint {
                TextHint::Document => DOCUMENT_PROMPT,
                TextHint::Mrz => MRZ_PROMPT,
            },
            max_tokens: 512,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecognitionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let llava: LlavaResponse = response.json().await?;
        Ok(llava.result.description)
    }
}

// ── Canned recognizers ──────────────────────────────────────────────

/// Barcode decoder returning a fixed payload; for tests and offline runs.
#[derive(Debug, Default)]
pub struct FixedBarcodeDecoder {
    payload: Option<String>,
    calls: AtomicUsize,
}

impl FixedBarcodeDecoder {
    pub fn new(payload: Option<&str>) -> Self {
        Self {
            payload: payload.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BarcodeDecoder for FixedBarcodeDecoder {
    async fn decode_pdf417(&self, _image: &GrayImage) -> Result<Option<DecodedBarcode>, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.as_ref().map(|p| DecodedBarcode {
            symbology: "pdf417".to_string(),
            payload: p.as_bytes().to_vec(),
        }))
    }
}

/// Text recognizer returning fixed text per hint. A missing entry fails as unavailable.
#[derive(Debug, Default)]
pub struct FixedTextRecognizer {
    document: Option<String>,
    mrz: Option<String>,
    calls: AtomicUsize,
}

impl FixedTextRecognizer {
    pub fn new(document: Option<&str>, mrz: Option<&str>) -> Self {
        Self {
            document: document.map(str::to_string),
            mrz: mrz.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextRecognizer for FixedTextRecognizer {
    async fn recognize(&self, _image: &RgbImage, hint: TextHint) -> Result<String, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = match hint {
            TextHint::Document => &self.document,
            TextHint::Mrz => &self.mrz,
        };
        text.clone()
            .ok_or_else(|| RecognitionError::Unavailable(format!("no canned text for {hint:?}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Recognition service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to encode image for recognition: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Recognition task failed: {0}")]
    Task(String),

    #[error("Recognizer unavailable: {0}")]
    Unavailable(String),
}

impl RecognitionError {
    /// Client-side rejections (4xx other than 429) will not improve on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RecognitionError::Status { status, .. } => *status == 429 || *status >= 500,
            RecognitionError::Encode(_) => false,
            _ => true,
        }
    }

    pub fn into_pipeline(self, stage: Stage) -> PipelineError {
        if self.is_transient() {
            PipelineError::transient(stage, self)
        } else {
            PipelineError::invalid_input(stage, self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_status_classification() {
        let throttled = RecognitionError::Status { status: 429, body: String::new() };
        let rejected = RecognitionError::Status { status: 400, body: "bad image".into() };
        let down = RecognitionError::Status { status: 503, body: String::new() };
        assert!(throttled.is_transient());
        assert!(!rejected.is_transient());
        assert!(down.is_transient());
        assert_eq!(rejected.into_pipeline(Stage::Extract).kind, ErrorKind::InvalidInput);
        assert_eq!(down.into_pipeline(Stage::Extract).kind, ErrorKind::TransientIo);
    }

    #[tokio::test]
    async fn test_fixed_recognizer_by_hint() {
        let ocr = FixedTextRecognizer::new(Some("DOCUMENTO 30.111.222"), None);
        let img = RgbImage::new(4, 4);
        assert_eq!(ocr.recognize(&img, TextHint::Document).await.unwrap(), "DOCUMENTO 30.111.222");
        assert!(matches!(
            ocr.recognize(&img, TextHint::Mrz).await,
            Err(RecognitionError::Unavailable(_))
        ));
        assert_eq!(ocr.calls(), 2);
    }

    #[tokio::test]
    async fn test_rxing_finds_nothing_on_blank_image() {
        let blank = GrayImage::from_pixel(200, 100, image::Luma([255]));
        let decoded = RxingBarcodeDecoder::new().decode_pdf417(&blank).await.unwrap();
        assert!(decoded.is_none());
    }
}
