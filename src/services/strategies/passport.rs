use once_cell::sync::Lazy;
use regex::Regex;

use super::ExtractionContext;
use crate::models::extraction::{ExtractionResult, FieldMap};
use crate::services::parsers::mrz;
use crate::services::text::title_case;

static PASSPORT_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{2,3}\d{6,9})\b").expect("valid regex"));
// Either label order, optionally paired bilingually, value on the same or next line.
static SURNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:APELLIDOS?|SURNAMES?)(?:\s*/\s*(?:APELLIDOS?|SURNAMES?))?\s*[:\-]?\s*([A-Z]+)")
        .expect("valid regex")
});
static GIVEN_NAMES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:NOMBRES?|GIVEN\s+NAMES?)(?:\s*/\s*(?:NOMBRES?|GIVEN\s+NAMES?))?\s*[:\-]?\s*([A-Z]+)")
        .expect("valid regex")
});
static DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{2}[/\-.]\d{2}[/\-.]\d{4}").expect("valid regex"));

/// TD3 zone first; labelled page text when the zone is unreadable.
pub async fn extract(ctx: &ExtractionContext) -> ExtractionResult {
    if let Some(fields) = ctx.mrz_text().await.and_then(mrz::parse_passport_text) {
        let confidence = if fields.contains_key("numero_pasaporte") { 0.9 } else { 0.5 };
        return ExtractionResult::new("mrz", fields, confidence);
    }

    let fields = ctx
        .document_text()
        .await
        .map(parse_passport_page)
        .unwrap_or_default();
    if fields.is_empty() {
        return ExtractionResult::empty("none");
    }
    let confidence = if fields.contains_key("numero_pasaporte") { 0.6 } else { 0.3 };
    ExtractionResult::new("ocr", fields, confidence)
}

/// Fields from the printed data page.
pub fn parse_passport_page(page_text: &str) -> FieldMap {
    let upper = page_text.to_uppercase();
    let mut fields = FieldMap::new();

    if let Some(caps) = PASSPORT_NUMBER.captures(&upper) {
        fields.insert("numero_pasaporte".into(), caps[1].to_string());
    }
    if upper.contains("ARGENTIN") {
        fields.insert("nacionalidad".into(), "ARGENTINA".into());
    }
    for (pattern, key) in [(&*SURNAME, "apellido"), (&*GIVEN_NAMES, "nombre")] {
        if let Some(caps) = pattern.captures(&upper) {
            fields.insert(key.into(), title_case(&caps[1]));
        }
    }

    let dates: Vec<&str> = DATE.find_iter(&upper).map(|m| m.as_str()).collect();
    if let Some(first) = dates.first() {
        fields.insert("fecha_nacimiento".into(), first.to_string());
    }
    if dates.len() > 1 {
        if let Some(last) = dates.last() {
            fields.insert("fecha_vencimiento".into(), last.to_string());
        }
    }
    fields
}
