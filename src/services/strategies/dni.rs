//! DNI strategies: the fused multi-source read plus the per-layout readers.

use once_cell::sync::Lazy;
use regex::Regex;

use super::fusion::fuse;
use super::ExtractionContext;
use crate::models::extraction::{ExtractionResult, FieldMap};
use crate::services::parsers::{mrz, pdf417};
use crate::services::text::{self, clean_name};

const BACK_PDF417_CONFIDENCE: f64 = 0.95;
const BACK_MRZ_CONFIDENCE: f64 = 0.85;

static LEGACY_NUMBER: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"DOCUMENTO\s*(?:NACIONAL)?\s*(?:DE)?\s*(?:IDENTIDAD)?\s*[:\-#]?\s*(\d{7,8})",
        r"N[°UOo]?\s*(?:DE)?\s*(?:DOCUMENTO)?\s*[:\-]?\s*(\d{7,8})",
        r"\b(\d{7,8})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});
static LEGACY_SURNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"APELLIDOS?\s*[:\-]?\s*(.+)").expect("valid regex"));
static LEGACY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"NOMBRES?\s*[:\-]?\s*(.+)").expect("valid regex"));
static ANY_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2})[/\-.](\d{2})[/\-.](\d{4})").expect("valid regex"));

/// PDF417, MRZ and free text read concurrently and fused.
pub async fn unified(ctx: &ExtractionContext) -> ExtractionResult {
    let (payload, mrz_text, document_text) =
        tokio::join!(ctx.pdf417_payload(), ctx.mrz_text(), ctx.document_text());

    let from_pdf417 = payload.map(pdf417::parse).unwrap_or_default();
    let from_mrz = mrz_text.and_then(mrz::parse_id_text).unwrap_or_default();
    let from_ocr = document_text.map(text::parse_dni_text).unwrap_or_default();

    fuse(&from_pdf417, &from_mrz, &from_ocr).into()
}

/// Current-layout front: labelled bilingual text only.
pub async fn new_front(ctx: &ExtractionContext) -> ExtractionResult {
    let Some(document_text) = ctx.document_text().await else {
        return ExtractionResult::empty("none");
    };
    let fields = text::parse_dni_text(document_text);
    if fields.is_empty() {
        return ExtractionResult::empty("none");
    }
    let has_number = fields.contains_key("numero_documento");
    let confidence = match fields.len() {
        n if has_number && n >= 3 => 0.85,
        _ if has_number => 0.70,
        n if n >= 2 => 0.55,
        _ => 0.30,
    };
    ExtractionResult::new("ocr", fields, confidence)
}

/// Current-layout back: the barcode when it decodes, else the MRZ band.
pub async fn new_back(ctx: &ExtractionContext) -> ExtractionResult {
    if let Some(payload) = ctx.pdf417_payload().await {
        let fields = pdf417::parse(payload);
        if !fields.is_empty() {
            return ExtractionResult::new("pdf417", fields, BACK_PDF417_CONFIDENCE);
        }
    }
    if let Some(fields) = ctx.mrz_band_text().await.and_then(mrz::parse_id_text) {
        return ExtractionResult::new("mrz", fields, BACK_MRZ_CONFIDENCE);
    }
    ExtractionResult::empty("none")
}

/// Pre-2009 booklet-style card: Spanish labels, no machine-readable zone.
pub async fn old(ctx: &ExtractionContext) -> ExtractionResult {
    let Some(document_text) = ctx.document_text().await else {
        return ExtractionResult::empty("none");
    };
    let fields = parse_legacy_text(document_text);
    if fields.is_empty() {
        return ExtractionResult::empty("none");
    }
    let has_number = fields.contains_key("numero_documento");
    let confidence = match fields.len() {
        n if has_number && n >= 3 => 0.75,
        _ if has_number => 0.60,
        n if n >= 2 => 0.45,
        _ => 0.20,
    };
    ExtractionResult::new("ocr", fields, confidence)
}

pub fn parse_legacy_text(document_text: &str) -> FieldMap {
    let upper = document_text.to_uppercase();
    let mut fields = FieldMap::new();

    if let Some(number) = LEGACY_NUMBER
        .iter()
        .find_map(|pattern| pattern.captures(&upper).map(|c| c[1].to_string()))
    {
        fields.insert("numero_documento".into(), number);
    }
    for (pattern, key) in [(&*LEGACY_SURNAME, "apellido"), (&*LEGACY_NAME, "nombre")] {
        if let Some(value) = upper.lines().find_map(|line| {
            pattern.captures(line).and_then(|c| clean_name(&c[1]))
        }) {
            fields.insert(key.into(), value);
        }
    }
    if upper.contains("MASCULINO") {
        fields.insert("sexo".into(), "M".into());
    } else if upper.contains("FEMENINO") {
        fields.insert("sexo".into(), "F".into());
    }
    if upper.contains("ARGENTIN") {
        fields.insert("nacionalidad".into(), "ARGENTINA".into());
    }
    if let Some(caps) = ANY_DATE.captures(&upper) {
        fields.insert(
            "fecha_nacimiento".into(),
            format!("{}/{}/{}", &caps[1], &caps[2], &caps[3]),
        );
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::strategies::test_support::context;

    const NEW_PAYLOAD: &str = "00123456789@GONZALEZ@MARIA LAURA@F@30111222@A@15031985@20062017@27-30111222-4";
    const TD1: &str = "IDARG30111222<4<<<<<<<<<<<<<<<\n8503155F2706209ARG<<<<<<<<<<<2\nGONZALEZ<<MARIA<LAURA<<<<<<<<<";
    const OLD_TEXT: &str = "REPUBLICA ARGENTINA\nDOCUMENTO NACIONAL DE IDENTIDAD 12345678\n\
        APELLIDO: PEREZ\nNOMBRES: JUAN CARLOS\nMASCULINO\n03/04/1960";

    #[tokio::test]
    async fn test_unified_verifies_matching_sources() {
        let ctx = context(Some(NEW_PAYLOAD), None, Some(TD1));
        let result = unified(&ctx).await;
        assert_eq!(result.source, "pdf417+verified");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.fields["numero_documento"], "30111222");
        assert_eq!(result.fields["tramite"], "00123456789");
    }

    #[tokio::test]
    async fn test_back_prefers_barcode() {
        let ctx = context(Some(NEW_PAYLOAD), None, Some(TD1));
        let result = new_back(&ctx).await;
        assert_eq!(result.source, "pdf417");
        assert_eq!(result.confidence, 0.95);
    }

    #[tokio::test]
    async fn test_back_falls_back_to_mrz_band() {
        let ctx = context(None, None, Some(TD1));
        let result = new_back(&ctx).await;
        assert_eq!(result.source, "mrz");
        assert_eq!(result.confidence, 0.85);
        assert_eq!(result.fields["fecha_nacimiento"], "15/03/1985");
    }

    #[tokio::test]
    async fn test_back_with_nothing_is_empty() {
        let ctx = context(None, None, None);
        let result = new_back(&ctx).await;
        assert!(result.is_empty());
        assert_eq!(result.source, "none");
    }

    #[test]
    fn test_legacy_text_fields() {
        let fields = parse_legacy_text(OLD_TEXT);
        assert_eq!(fields["numero_documento"], "12345678");
        assert_eq!(fields["apellido"], "Perez");
        assert_eq!(fields["nombre"], "Juan Carlos");
        assert_eq!(fields["sexo"], "M");
        assert_eq!(fields["nacionalidad"], "ARGENTINA");
        assert_eq!(fields["fecha_nacimiento"], "03/04/1960");
    }

    #[tokio::test]
    async fn test_legacy_confidence_with_number_and_fields() {
        let ctx = context(None, Some(OLD_TEXT), None);
        let result = old(&ctx).await;
        assert_eq!(result.source, "ocr");
        assert_eq!(result.confidence, 0.75);
    }
}
