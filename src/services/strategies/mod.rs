//! Extraction strategies and the registry that picks them.
//!
//! Every strategy reads through one [`ExtractionContext`] per document, so a
//! recognizer is called at most once per image and hint no matter how many
//! strategies ask for its output.

pub mod dni;
pub mod fusion;
pub mod license;
pub mod passport;

use std::sync::Arc;

use image::{GrayImage, RgbImage};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::models::document::DocumentType;
use crate::models::extraction::{ExtractionResult, Source, Variant};
use crate::services::imaging::{self, Roi};
use crate::services::pii;
use crate::services::recognition::{BarcodeDecoder, RecognitionError, TextHint, TextRecognizer};

/// Bottom band of a DNI back where the MRZ is printed.
const MRZ_BAND: Roi = Roi::new(0.0, 0.70, 1.0, 0.30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Strategy {
    /// PDF417 + MRZ + free text, fused.
    Unified,
    DniNewFront,
    DniNewBack,
    DniOld,
    PassportMrz,
    License,
}

impl Strategy {
    pub async fn extract(self, ctx: &ExtractionContext) -> ExtractionResult {
        match self {
            Strategy::Unified => dni::unified(ctx).await,
            Strategy::DniNewFront => dni::new_front(ctx).await,
            Strategy::DniNewBack => dni::new_back(ctx).await,
            Strategy::DniOld => dni::old(ctx).await,
            Strategy::PassportMrz => passport::extract(ctx).await,
            Strategy::License => license::extract(ctx).await,
        }
    }
}

/// Strategies to run, in preference order, for a declared type and classified variant.
pub fn strategies_for(document_type: DocumentType, variant: Option<Variant>) -> &'static [Strategy] {
    use Strategy::*;
    match document_type {
        DocumentType::Passport => &[PassportMrz],
        DocumentType::License => &[License],
        DocumentType::Dni => match variant {
            Some(Variant::DniNewBack) => &[Unified, DniNewBack],
            Some(Variant::DniNewFront) => &[Unified, DniNewFront],
            Some(Variant::DniOld) => &[Unified, DniOld],
            Some(Variant::Unknown) | None => &[Unified, DniNewFront, DniOld],
        },
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// A recognizer call that failed while extracting one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: Source,
    pub message: String,
    pub transient: bool,
}

/// Shared, read-only view of one normalized image plus memoized recognizer output.
pub struct ExtractionContext {
    image: Arc<RgbImage>,
    gray: Arc<GrayImage>,
    barcode: Arc<dyn BarcodeDecoder>,
    ocr: Arc<dyn TextRecognizer>,
    pdf417: OnceCell<Option<String>>,
    document_text: OnceCell<Option<String>>,
    mrz_text: OnceCell<Option<String>>,
    mrz_band_text: OnceCell<Option<String>>,
    failures: Mutex<Vec<SourceFailure>>,
}

impl ExtractionContext {
    pub fn new(image: RgbImage, barcode: Arc<dyn BarcodeDecoder>, ocr: Arc<dyn TextRecognizer>) -> Self {
        let gray = imaging::to_gray(&image);
        Self {
            image: Arc::new(image),
            gray: Arc::new(gray),
            barcode,
            ocr,
            pdf417: OnceCell::new(),
            document_text: OnceCell::new(),
            mrz_text: OnceCell::new(),
            mrz_band_text: OnceCell::new(),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Raw PDF417 payload, if a symbol was decoded.
    pub async fn pdf417_payload(&self) -> Option<&str> {
        self.pdf417
            .get_or_init(|| async {
                match self.barcode.decode_pdf417(&self.gray).await {
                    Ok(Some(decoded)) => {
                        let text = decoded.text();
                        debug!(payload = %pii::fingerprint(&text), "PDF417 decoded");
                        Some(text)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        self.record(Source::Pdf417, e).await;
                        None
                    }
                }
            })
            .await
            .as_deref()
    }

    /// Free text of the whole document.
    pub async fn document_text(&self) -> Option<&str> {
        self.document_text
            .get_or_init(|| self.recognize(&self.image, TextHint::Document, Source::Ocr))
            .await
            .as_deref()
    }

    /// MRZ transcription of the whole image.
    pub async fn mrz_text(&self) -> Option<&str> {
        self.mrz_text
            .get_or_init(|| self.recognize(&self.image, TextHint::Mrz, Source::Mrz))
            .await
            .as_deref()
    }

    /// MRZ transcription of the bottom band only.
    pub async fn mrz_band_text(&self) -> Option<&str> {
        self.mrz_band_text
            .get_or_init(|| async {
                let band = imaging::crop_rgb(&self.image, MRZ_BAND);
                self.recognize(&band, TextHint::Mrz, Source::Mrz).await
            })
            .await
            .as_deref()
    }

    pub async fn failures(&self) -> Vec<SourceFailure> {
        self.failures.lock().await.clone()
    }

    pub async fn has_transient_failure(&self) -> bool {
        self.failures.lock().await.iter().any(|f| f.transient)
    }

    async fn recognize(&self, image: &RgbImage, hint: TextHint, source: Source) -> Option<String> {
        match self.ocr.recognize(image, hint).await {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(text),
            Err(e) => {
                self.record(source, e).await;
                None
            }
        }
    }

    async fn record(&self, source: Source, error: RecognitionError) {
        warn!(source = %source, error = %error, transient = error.is_transient(), "recognizer failed");
        self.failures.lock().await.push(SourceFailure {
            source,
            message: error.to_string(),
            transient: error.is_transient(),
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::recognition::{FixedBarcodeDecoder, FixedTextRecognizer};

    #[test]
    fn test_registry_per_type() {
        assert_eq!(strategies_for(DocumentType::Passport, None), &[Strategy::PassportMrz]);
        assert_eq!(strategies_for(DocumentType::License, Some(Variant::DniOld)), &[Strategy::License]);
        assert_eq!(
            strategies_for(DocumentType::Dni, Some(Variant::DniNewBack)),
            &[Strategy::Unified, Strategy::DniNewBack]
        );
        assert_eq!(
            strategies_for(DocumentType::Dni, Some(Variant::Unknown)),
            &[Strategy::Unified, Strategy::DniNewFront, Strategy::DniOld]
        );
    }

    #[tokio::test]
    async fn test_recognizers_called_once_per_hint() {
        let barcode = Arc::new(FixedBarcodeDecoder::new(None));
        let ocr = Arc::new(FixedTextRecognizer::new(Some("DOCUMENTO 30.111.222"), None));
        let ctx = ExtractionContext::new(RgbImage::new(40, 30), barcode.clone(), ocr.clone());

        for _ in 0..3 {
            assert_eq!(ctx.document_text().await, Some("DOCUMENTO 30.111.222"));
            assert!(ctx.pdf417_payload().await.is_none());
        }
        assert_eq!(ocr.calls(), 1);
        assert_eq!(barcode.calls(), 1);
    }

    #[tokio::test]
    async fn test_recognizer_failure_is_recorded() {
        let ctx = test_support::context(None, None, None);
        assert!(ctx.mrz_text().await.is_none());
        let failures = ctx.failures().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, Source::Mrz);
        assert!(ctx.has_transient_failure().await);
    }
}
