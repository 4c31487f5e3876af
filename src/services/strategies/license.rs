//! Argentine driver's license: a table of labelled patterns over the card text.

use once_cell::sync::Lazy;
use regex::Regex;

use super::ExtractionContext;
use crate::models::extraction::{ExtractionResult, FieldMap};

const MAX_CONFIDENCE: f64 = 0.95;
const COVERAGE_WEIGHT: f64 = 1.2;

const DATE: &str = r"(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4})";

#[derive(Debug, Clone, Copy)]
enum Clean {
    Keep,
    Digits,
    DocumentNumber,
    Date,
}

struct FieldRule {
    field: &'static str,
    patterns: Vec<Regex>,
    clean: Clean,
}

static RULES: Lazy<Vec<FieldRule>> = Lazy::new(|| {
    let date = |label: &str| format!(r"{label}\s*[:\-]?\s*{DATE}");
    vec![
        rule("numero_licencia", Clean::Digits, &[
            r"(?:N[°O]?\s*)?(?:LIC(?:ENCIA)?\.?\s*)(\d{8,11})".to_string(),
            r"LICENCIA\s*[:\-]?\s*(\d+)".to_string(),
        ]),
        rule("numero_documento", Clean::DocumentNumber, &[
            r"(?:DNI|D\.N\.I\.?|DOCUMENTO)\s*[:\-]?\s*(\d{6,8}|\d{1,2}\.\d{3}\.\d{3})".to_string(),
            r"\b(\d{2}[.\s]?\d{3}[.\s]?\d{3})\b".to_string(),
        ]),
        rule("apellido", Clean::Keep, &[r"(?:APELLIDO|SURNAME)S?\s*[:\-]?\s*([A-ZÁÉÍÓÚÑ]+)".to_string()]),
        rule("nombre", Clean::Keep, &[r"(?:NOMBRES?|NAME)\s*[:\-]?\s*([A-ZÁÉÍÓÚÑ ]+)".to_string()]),
        rule("fecha_nacimiento", Clean::Date, &[
            date(r"(?:F(?:ECHA)?\.?\s*(?:DE\s*)?)?(?:NAC(?:IMIENTO)?\.?|BIRTH)"),
            date(r"NACIDO(?:\s*EL)?"),
        ]),
        rule("fecha_vencimiento", Clean::Date, &[
            date(r"(?:F(?:ECHA)?\.?\s*(?:DE\s*)?)?(?:VENC(?:IMIENTO)?\.?|EXPIRY|VTO\.?)"),
            date(r"VALIDO?\s*HASTA"),
        ]),
        rule("fecha_emision", Clean::Date, &[
            date(r"(?:F(?:ECHA)?\.?\s*(?:DE\s*)?)?(?:EMISI[OÓ]N|OTORG(?:AMIENTO)?)"),
        ]),
        rule("clase", Clean::Keep, &[
            r"(?:CLASE|CLASS)\s*[:\-]?\s*([A-Z]\d?(?:\.\d)?)\b".to_string(),
            r"CLASES?\s*HABILITADAS?\s*[:\-]?\s*([A-Z\d.,]+)".to_string(),
        ]),
        rule("domicilio", Clean::Keep, &[r"(?m)(?:DOMICILIO|DOM\.|DIRECCI[OÓ]N)\s*[:\-]?\s*(.+?)\s*$".to_string()]),
        rule("grupo_sanguineo", Clean::Keep, &[
            r"(?:GRUPO|BLOOD|SANG)\s*[:\-]?\s*([ABO]{1,2}[+\-]?)".to_string(),
            r"GR\.?\s*SANG\.?\s*[:\-]?\s*([ABO]{1,2}[+\-]?)".to_string(),
        ]),
        rule("cuil", Clean::Keep, &[r"(?:CUIL|C\.U\.I\.L\.?)\s*[:\-]?\s*(\d{2}[\-\s]?\d{8}[\-\s]?\d)".to_string()]),
    ]
});

fn rule(field: &'static str, clean: Clean, patterns: &[String]) -> FieldRule {
    FieldRule {
        field,
        patterns: patterns.iter().map(|p| Regex::new(p).expect("valid regex")).collect(),
        clean,
    }
}

pub async fn extract(ctx: &ExtractionContext) -> ExtractionResult {
    let fields = ctx
        .document_text()
        .await
        .map(parse_license_text)
        .unwrap_or_default();
    if fields.is_empty() {
        return ExtractionResult::empty("none");
    }
    let coverage = fields.len() as f64 / RULES.len() as f64;
    let confidence = (coverage * COVERAGE_WEIGHT).min(MAX_CONFIDENCE);
    ExtractionResult::new("ocr", fields, (confidence * 100.0).round() / 100.0)
}

pub fn parse_license_text(card_text: &str) -> FieldMap {
    let upper = card_text.to_uppercase();
    let mut fields = FieldMap::new();
    for rule in RULES.iter() {
        let found = rule
            .patterns
            .iter()
            .find_map(|p| p.captures(&upper))
            .map(|caps| clean(&caps[1], rule.clean))
            .filter(|value| !value.is_empty());
        if let Some(value) = found {
            fields.insert(rule.field.to_string(), value);
        }
    }
    fields
}

fn clean(value: &str, how: Clean) -> String {
    match how {
        Clean::Keep => value.trim().to_string(),
        Clean::Digits => value.chars().filter(char::is_ascii_digit).collect(),
        Clean::DocumentNumber => value.chars().filter(|c| *c != '.' && !c.is_whitespace()).collect(),
        Clean::Date => value
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == '-' || c == '.' { '/' } else { c })
            .collect(),
    }
}
