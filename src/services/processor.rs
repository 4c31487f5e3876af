use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result, Stage};
use crate::models::document::DocumentType;
use crate::models::extraction::{ExtractionResult, ProcessedDocument};
use crate::services::classifier::{Classification, VariantClassifier};
use crate::services::normalize::Normalizer;
use crate::services::pii;
use crate::services::recognition::{BarcodeDecoder, TextRecognizer};
use crate::services::strategies::{strategies_for, ExtractionContext, Strategy};

/// Normalization, classification and extraction for one image.
pub struct DocumentProcessor {
    normalizer: Arc<Normalizer>,
    classifier: VariantClassifier,
    barcode: Arc<dyn BarcodeDecoder>,
    ocr: Arc<dyn TextRecognizer>,
}

struct Prepared {
    image: RgbImage,
    classification: Option<Classification>,
    warnings: Vec<String>,
}

impl DocumentProcessor {
    pub fn new(barcode: Arc<dyn BarcodeDecoder>, ocr: Arc<dyn TextRecognizer>) -> Self {
        Self {
            normalizer: Arc::new(Normalizer::default()),
            classifier: VariantClassifier::new(),
            barcode,
            ocr,
        }
    }

    /// Fails only when the image is unreadable or no strategy produced a field.
    pub async fn process(&self, bytes: Vec<u8>, document_type: DocumentType) -> Result<ProcessedDocument> {
        let started = Instant::now();

        let normalizer = self.normalizer.clone();
        let classifier = self.classifier.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare(&bytes, document_type, &normalizer, &classifier))
            .await
            .map_err(|e| PipelineError::transient(Stage::Normalize, e))??;

        let variant = prepared.classification.as_ref().map(|c| c.variant);
        if let Some(classification) = &prepared.classification {
            debug!(
                variant = %classification.variant,
                confidence = classification.confidence,
                pdf417 = classification.signals.pdf417,
                mrz = classification.signals.mrz,
                "document classified"
            );
        }

        let ctx = ExtractionContext::new(prepared.image, self.barcode.clone(), self.ocr.clone());
        let mut best: Option<(ExtractionResult, Strategy)> = None;
        for strategy in strategies_for(document_type, variant) {
            let result = strategy.extract(&ctx).await;
            debug!(strategy = %strategy, source = %result.source, confidence = result.confidence, fields = result.fields.len(), "strategy finished");
            if result.is_empty() {
                continue;
            }
            let better = match &best {
                None => true,
                // A reported disagreement between sources stands; no single reader overrides it.
                Some((current, _)) if current.provenance.discrepancy => false,
                // Ties keep the earlier strategy.
                Some((current, _)) => result.confidence > current.confidence,
            };
            if better {
                best = Some((result, *strategy));
            }
        }

        let mut warnings = prepared.warnings;
        let failures = ctx.failures().await;
        warnings.extend(failures.iter().map(|f| format!("{}: {}", f.source, f.message)));

        let Some((result, strategy)) = best else {
            return Err(if ctx.has_transient_failure().await {
                PipelineError::transient(Stage::Extract, format!("no fields extracted; {}", warnings.join("; ")))
            } else {
                PipelineError::invalid_input(Stage::Extract, "no fields extracted")
            });
        };

        let processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            document_type = %document_type,
            strategy = %strategy,
            source = %result.source,
            confidence = result.confidence,
            verified = result.provenance.verified,
            discrepancy = result.provenance.discrepancy,
            fields = ?pii::mask_fields(&result.fields),
            processing_time_ms,
            "document extracted"
        );

        Ok(ProcessedDocument {
            variant,
            classifier_confidence: prepared.classification.map(|c| c.confidence),
            source: result.source,
            fields: result.fields,
            confidence: result.confidence,
            provenance: result.provenance,
            processing_time_ms,
            warnings,
        })
    }
}

fn prepare(
    bytes: &[u8],
    document_type: DocumentType,
    normalizer: &Normalizer,
    classifier: &VariantClassifier,
) -> Result<Prepared> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::invalid_input(Stage::Decode, format!("unreadable image: {e}")))?
        .to_rgb8();
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(PipelineError::invalid_input(Stage::Decode, "empty image"));
    }

    let normalized = normalizer.run(decoded);
    if !normalized.warnings.is_empty() {
        warn!(steps = ?normalized.warnings, "normalization degraded");
    }
    let classification =
        (document_type == DocumentType::Dni).then(|| classifier.classify(&normalized.image));

    Ok(Prepared {
        image: normalized.image,
        classification,
        warnings: normalized.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::extraction::Source;
    use crate::services::recognition::{FixedBarcodeDecoder, FixedTextRecognizer};
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn card_png() -> Vec<u8> {
        let img = RgbImage::from_fn(320, 200, |x, y| {
            if (40..120).contains(&x) && (40..150).contains(&y) {
                Rgb([200, 150, 120])
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

    fn processor(pdf417: Option<&str>, document: Option<&str>, mrz: Option<&str>) -> DocumentProcessor {
        DocumentProcessor::new(
            Arc::new(FixedBarcodeDecoder::new(pdf417)),
            Arc::new(FixedTextRecognizer::new(document, mrz)),
        )
    }

    #[tokio::test]
    async fn test_barcode_only_dni() {
        let payload = "00123456789@GONZALEZ@MARIA LAURA@F@30111222@A@15031985@20062017";
        let doc = processor(Some(payload), None, None)
            .process(card_png(), DocumentType::Dni)
            .await
            .unwrap();
        assert_eq!(doc.fields["numero_documento"], "30111222");
        assert!(doc.confidence >= 0.9);
        assert!(doc.variant.is_some());
        assert!(!doc.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_passport_is_not_classified() {
        let page = "PASAPORTE\nAAB123456\nAPELLIDO / SURNAME\nGONZALEZ";
        let doc = processor(None, Some(page), Some("no zone"))
            .process(card_png(), DocumentType::Passport)
            .await
            .unwrap();
        assert!(doc.variant.is_none());
        assert_eq!(doc.source, "ocr");
        assert_eq!(doc.fields["numero_pasaporte"], "AAB123456");
    }

    #[tokio::test]
    async fn test_unreadable_bytes_are_invalid_input() {
        let err = processor(None, None, None)
            .process(b"definitely not an image".to_vec(), DocumentType::Dni)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.stage, Stage::Decode);
    }

    #[tokio::test]
    async fn test_nothing_found_is_invalid_input() {
        let err = processor(None, Some("???"), Some("???"))
            .process(card_png(), DocumentType::Dni)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.message, "no fields extracted");
    }

    #[tokio::test]
    async fn test_failed_recognizers_are_transient() {
        let err = processor(None, None, None)
            .process(card_png(), DocumentType::License)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.stage, Stage::Extract);
    }

    #[tokio::test]
    async fn test_extraction_is_deterministic() {
        let payload = "00123456789@PEREZ@JUAN@M@20333444@B@01011990@05052015";
        let p = processor(Some(payload), Some("DOCUMENTO 20.333.444"), None);
        let first = p.process(card_png(), DocumentType::Dni).await.unwrap();
        let second = p.process(card_png(), DocumentType::Dni).await.unwrap();
        assert_eq!(first.fields, second.fields);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.source, second.source);
    }

    const BARCODE: &str = "00123456789@GONZALEZ@MARIA LAURA@F@30111222@A@15031985@20062017";

    #[tokio::test]
    async fn test_agreeing_barcode_and_text_are_verified() {
        let doc = processor(Some(BARCODE), Some("DOCUMENTO 30.111.222"), None)
            .process(card_png(), DocumentType::Dni)
            .await
            .unwrap();
        assert!(doc.provenance.verified);
        assert!(!doc.provenance.discrepancy);
        assert_eq!(doc.provenance.sources_used, vec![Source::Pdf417, Source::Ocr]);
        assert_eq!(doc.confidence, 1.0);
        assert_eq!(doc.source, "pdf417+verified");
    }

    #[tokio::test]
    async fn test_disagreeing_numbers_keep_the_discrepancy() {
        let doc = processor(Some(BARCODE), Some("DOCUMENTO 30.111.999"), None)
            .process(card_png(), DocumentType::Dni)
            .await
            .unwrap();
        assert!(doc.provenance.discrepancy);
        assert!(!doc.provenance.verified);
        assert_eq!(doc.confidence, 0.85);
        assert_eq!(doc.fields["numero_documento"], "30111222");
    }

    #[tokio::test]
    async fn test_discrepancy_survives_a_more_confident_single_reader() {
        // Barcode-like stripes on a card back; the back reader alone reports 0.95.
        let back = {
            let img = RgbImage::from_fn(640, 400, |_, y| {
                if (260..380).contains(&y) && y % 4 < 2 {
                    Rgb([0, 0, 0])
                } else {
                    Rgb([240, 240, 240])
                }
            });
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, ImageFormat::Png).unwrap();
            buf.into_inner()
        };
        let doc = processor(Some(BARCODE), Some("DOCUMENTO 30.111.999"), None)
            .process(back, DocumentType::Dni)
            .await
            .unwrap();
        assert!(doc.provenance.discrepancy);
        assert!(doc.confidence < 0.95);
    }
}
