//! Priority merge of PDF417, MRZ and free-text fields with a cross-check
//! on the document number.

use crate::models::extraction::{FieldMap, FusedResult, Source};

const PDF417_BASE: f64 = 0.90;
const MRZ_BASE: f64 = 0.85;
const OCR_RICH_BASE: f64 = 0.70;
const OCR_BASE: f64 = 0.50;
const OCR_RICH_FIELDS: usize = 3;
const MULTI_SOURCE_BONUS: f64 = 0.05;
const VERIFIED_BONUS: f64 = 0.05;
const DISCREPANCY_PENALTY: f64 = 0.10;
const DISCREPANCY_FLOOR: f64 = 0.30;

const CROSS_CHECK_FIELD: &str = "numero_documento";

/// Merge per-source field maps. An empty map means the source produced nothing.
///
/// For each key the first non-empty value in PDF417 > MRZ > OCR order wins.
pub fn fuse(pdf417: &FieldMap, mrz: &FieldMap, ocr: &FieldMap) -> FusedResult {
    let ranked = [(Source::Pdf417, pdf417), (Source::Mrz, mrz), (Source::Ocr, ocr)];
    let sources_used: Vec<Source> = ranked
        .iter()
        .filter(|(_, fields)| has_values(fields))
        .map(|(source, _)| *source)
        .collect();

    let mut fields = FieldMap::new();
    for (_, source_fields) in ranked.iter().rev() {
        for (key, value) in source_fields.iter() {
            if !value.trim().is_empty() {
                fields.insert(key.clone(), value.clone());
            }
        }
    }

    let numbers: Vec<String> = ranked
        .iter()
        .filter_map(|(_, f)| f.get(CROSS_CHECK_FIELD))
        .map(|n| n.chars().filter(char::is_ascii_alphanumeric).collect::<String>())
        .filter(|n| !n.is_empty())
        .collect();
    let (verified, discrepancy) = if numbers.len() >= 2 {
        let agree = numbers.iter().all(|n| *n == numbers[0]);
        (agree, !agree)
    } else {
        (false, false)
    };

    let confidence = confidence(&sources_used, ocr, verified, discrepancy);
    FusedResult {
        fields,
        verified,
        discrepancy,
        source: source_label(&sources_used),
        sources_used,
        confidence,
    }
}

fn has_values(fields: &FieldMap) -> bool {
    fields.values().any(|v| !v.trim().is_empty())
}

fn confidence(sources: &[Source], ocr: &FieldMap, verified: bool, discrepancy: bool) -> f64 {
    let base = sources
        .iter()
        .map(|source| match source {
            Source::Pdf417 => PDF417_BASE,
            Source::Mrz => MRZ_BASE,
            Source::Ocr if ocr.len() >= OCR_RICH_FIELDS => OCR_RICH_BASE,
            Source::Ocr => OCR_BASE,
        })
        .fold(0.0, f64::max);

    let mut score = base;
    if sources.len() >= 2 {
        score = (score + MULTI_SOURCE_BONUS).min(1.0);
    }
    if verified {
        score = (score + VERIFIED_BONUS).min(1.0);
    }
    if discrepancy {
        score = (score - DISCREPANCY_PENALTY).max(DISCREPANCY_FLOOR);
    }
    (score * 100.0).round() / 100.0
}

fn source_label(sources: &[Source]) -> String {
    match sources {
        [] => "none",
        [Source::Pdf417] => "pdf417",
        [Source::Pdf417, ..] => "pdf417+verified",
        [Source::Mrz, Source::Ocr] => "mrz+ocr",
        [Source::Mrz] => "mrz",
        _ => "ocr",
    }
    .to_string()
}
