//! Canonicalization of recognized free text: dates, document numbers and
//! labelled values on bilingual (Spanish/English) identity cards.

use once_cell::sync::Lazy;
use regex::Regex;
use strsim::jaro_winkler;

use crate::models::extraction::FieldMap;

/// Minimum similarity for a noisy month token to count as a known month.
const MONTH_MATCH_THRESHOLD: f64 = 0.92;

const MONTHS: &[(&str, &str)] = &[
    ("ENE", "01"), ("JAN", "01"), ("ENERO", "01"), ("JANUARY", "01"),
    ("FEB", "02"), ("FEBRERO", "02"), ("FEBRUARY", "02"),
    ("MAR", "03"), ("MARZO", "03"), ("MARCH", "03"),
    ("ABR", "04"), ("APR", "04"), ("ABRIL", "04"), ("APRIL", "04"),
    ("MAY", "05"), ("MAYO", "05"),
    ("JUN", "06"), ("JUNIO", "06"), ("JUNE", "06"),
    ("JUL", "07"), ("JULIO", "07"), ("JULY", "07"),
    ("AGO", "08"), ("AUG", "08"), ("AGOSTO", "08"), ("AUGUST", "08"),
    ("SEP", "09"), ("SET", "09"), ("SEPT", "09"), ("SEPTIEMBRE", "09"), ("SEPTEMBER", "09"),
    ("OCT", "10"), ("OCTUBRE", "10"), ("OCTOBER", "10"),
    ("NOV", "11"), ("NOVIEMBRE", "11"), ("NOVEMBER", "11"),
    ("DIC", "12"), ("DEC", "12"), ("DICIEMBRE", "12"), ("DECEMBER", "12"),
];

/// Labels that mark a line as a caption rather than a value.
const LABEL_MARKERS: &[&str] = &["/", "SEXO", "NACIONALIDAD", "FECHA", "DOCUMENTO", "TRAMITE"];

static TEXT_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})\s+([A-Z]{3,})\s*/?\s*[A-Z]*\s+(\d{4})").expect("valid regex"));
static NUMERIC_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})[/\-.](\d{1,2})[/\-.](\d{4})").expect("valid regex"));
static NOT_NAME_CHAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-ZÁÉÍÓÚÑ\s]").expect("valid regex"));
static DOTTED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}[.\s]\d{3}[.\s]\d{3})").expect("valid regex"));
static STRICT_DOTTED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{2}\.\d{3}\.\d{3})").expect("valid regex"));
static BARE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{7,8})\b").expect("valid regex"));
static TRAMITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{10,15})").expect("valid regex"));
static SEX_AFTER_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SEXO\s*/?\s*SEX\s*\n?\s*([MF])\b").expect("valid regex"));
static EJEMPLAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"EJEMPLAR\s*\n?\s*([A-Z])\b").expect("valid regex"));
static CUIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CUIL[:\s]*(\d{2}[-\s]?\d{8}[-\s]?\d)").expect("valid regex"));
static DOMICILIO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)DOMICILIO[:\s]*(.+?)$").expect("valid regex"));
static DATE_ON_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}\s+[A-Z]{3,}\s*/?\s*[A-Z]*\s+\d{4})").expect("valid regex"));

static DATE_LABELS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"FECHA\s*DE\s*NACIMIENTO|DATE\s*OF\s*BIRTH|NACIMIENTO", "fecha_nacimiento"),
        (r"FECHA\s*DE\s*EMISI[OÓ]N|DATE\s*OF\s*ISSUE|EXPEDICION", "fecha_emision"),
        (r"FECHA\s*DE\s*VENCIMIENTO|DATE\s*OF\s*EXPIRY|VENCIMIENTO", "fecha_vencimiento"),
    ]
    .into_iter()
    .map(|(pattern, field)| (Regex::new(pattern).expect("valid regex"), field))
    .collect()
});

static SURNAME_LABELS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile_all(&[r"APELLIDOS?\s*/?\s*SURNAME", r"SURNAME\s*/?\s*APELLIDO", r"APELLIDOS?:"])
});
static NAME_LABELS: Lazy<Vec<Regex>> =
    Lazy::new(|| compile_all(&[r"NOMBRES?\s*/?\s*NAME", r"NAME\s*/?\s*NOMBRE", r"NOMBRES?:"]));

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
}

// ── Primitive normalizers ───────────────────────────────────────────

/// Digits only; accepted when 7–9 digits remain.
pub fn normalize_document_number(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (7..=9).contains(&digits.len()).then_some(digits)
}

/// Exact month lookup, falling back to a close fuzzy match for OCR noise.
pub fn month_number(token: &str) -> Option<&'static str> {
    let token = token.to_uppercase();
    if let Some((_, month)) = MONTHS.iter().find(|(name, _)| *name == token) {
        return Some(*month);
    }
    MONTHS
        .iter()
        .map(|(name, month)| (jaro_winkler(name, &token), *month))
        .filter(|(score, _)| *score >= MONTH_MATCH_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, month)| month)
}

/// `"15 ENE/JAN 1990"` or `"15/01/1990"` → `"15/01/1990"`.
pub fn normalize_bilingual_date(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    if let Some(caps) = TEXT_DATE.captures(&upper) {
        if let Some(month) = month_number(&caps[2]) {
            return Some(format!("{:0>2}/{}/{}", &caps[1], month, &caps[3]));
        }
    }
    NUMERIC_DATE
        .captures(raw)
        .map(|caps| format!("{:0>2}/{:0>2}/{}", &caps[1], &caps[2], &caps[3]))
}

/// `"PEREZ GOMEZ"` → `"Perez Gomez"`.
pub fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip everything but letters and spaces, then title-case.
pub fn clean_name(value: &str) -> Option<String> {
    let upper = value.to_uppercase();
    let cleaned = NOT_NAME_CHAR.replace_all(&upper, "");
    let cleaned = cleaned.trim();
    (cleaned.chars().count() > 1).then(|| title_case(cleaned))
}

pub fn non_empty_lines(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
}

// ── Labelled extraction ─────────────────────────────────────────────

/// Value after the first matching label, on the same line or the next non-label line.
pub fn extract_value_after_label(lines: &[&str], labels: &[Regex]) -> Option<String> {
    for (i, line) in lines.iter().enumerate() {
        let upper = line.to_uppercase();
        for label in labels {
            let Some(found) = label.find(&upper) else {
                continue;
            };
            if let Some(value) = clean_name(&upper[found.end()..]) {
                return Some(value);
            }
            if let Some(next) = lines.get(i + 1) {
                let next_upper = next.trim().to_uppercase();
                let is_label = LABEL_MARKERS.iter().any(|m| next_upper.contains(m));
                if !next_upper.is_empty() && !is_label {
                    if let Some(value) = clean_name(&next_upper) {
                        return Some(value);
                    }
                }
            }
        }
    }
    None
}

/// Document number, trying progressively looser patterns.
pub fn extract_document_number(lines: &[&str]) -> Option<String> {
    for line in lines {
        let upper = line.to_uppercase();
        if upper.contains("DOCUMENTO") || upper.contains("DOCUMENT") {
            if let Some(m) = DOTTED_NUMBER.find(line) {
                return normalize_document_number(m.as_str());
            }
        }
    }
    for pattern in [&*STRICT_DOTTED_NUMBER, &*DOTTED_NUMBER] {
        if let Some(m) = lines.iter().find_map(|line| pattern.find(line)) {
            return normalize_document_number(m.as_str());
        }
    }
    lines
        .iter()
        .filter(|line| {
            let upper = line.to_uppercase();
            !upper.contains("TRAMITE") && !upper.contains("TRÁMITE")
        })
        .find_map(|line| BARE_NUMBER.captures(line).map(|c| c[1].to_string()))
}

pub fn extract_tramite(lines: &[&str]) -> Option<String> {
    for (i, line) in lines.iter().enumerate() {
        let upper = line.to_uppercase();
        if !(upper.contains("TRAMITE") || upper.contains("TRÁMITE")) {
            continue;
        }
        let same_or_next = TRAMITE
            .captures(line)
            .or_else(|| lines.get(i + 1).and_then(|next| TRAMITE.captures(next)));
        if let Some(caps) = same_or_next {
            return Some(caps[1].to_string());
        }
    }
    None
}

pub fn extract_sex(text_upper: &str) -> Option<String> {
    if text_upper.contains("MASCULINO") {
        return Some("M".to_string());
    }
    if text_upper.contains("FEMENINO") {
        return Some("F".to_string());
    }
    SEX_AFTER_LABEL
        .captures(text_upper)
        .map(|caps| caps[1].to_string())
}

pub fn extract_ejemplar(text_upper: &str) -> Option<String> {
    EJEMPLAR.captures(text_upper).map(|caps| caps[1].to_string())
}

/// Dates introduced by birth/issue/expiry labels.
pub fn extract_labelled_dates(lines: &[&str], fields: &mut FieldMap) {
    for (i, line) in lines.iter().enumerate() {
        let upper = line.to_uppercase();
        for (label, field) in DATE_LABELS.iter() {
            if !label.is_match(&upper) {
                continue;
            }
            let date = match DATE_ON_LINE.captures(&upper) {
                Some(caps) => normalize_bilingual_date(&caps[1]),
                None => lines.get(i + 1).and_then(|next| normalize_bilingual_date(next)),
            };
            if let Some(date) = date {
                fields.insert(field.to_string(), date);
            }
        }
    }
}

/// Full free-text parse used by the fused DNI strategy.
pub fn parse_dni_text(text: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    let upper = text.to_uppercase();
    let lines = non_empty_lines(text);

    if let Some(number) = extract_document_number(&lines) {
        fields.insert("numero_documento".into(), number);
    }
    if let Some(surname) = extract_value_after_label(&lines, &SURNAME_LABELS) {
        fields.insert("apellido".into(), surname);
    }
    if let Some(name) = extract_value_after_label(&lines, &NAME_LABELS) {
        fields.insert("nombre".into(), name);
    }
    if let Some(sex) = extract_sex(&upper) {
        fields.insert("sexo".into(), sex);
    }
    if upper.contains("ARGENTIN") {
        fields.insert("nacionalidad".into(), "ARGENTINA".into());
    }
    if let Some(tramite) = extract_tramite(&lines) {
        fields.insert("tramite".into(), tramite);
    }
    if let Some(ejemplar) = extract_ejemplar(&upper) {
        fields.insert("ejemplar".into(), ejemplar);
    }
    extract_labelled_dates(&lines, &mut fields);
    if let Some(caps) = CUIL.captures(&upper) {
        let cuil: String = caps[1]
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '-')
            .collect();
        fields.insert("cuil".into(), cuil);
    }
    if let Some(caps) = DOMICILIO.captures(text) {
        let address = caps[1].trim();
        if !address.is_empty() {
            fields.insert("domicilio".into(), address.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRONT_TEXT: &str = "REPUBLICA ARGENTINA\n\
        APELLIDO / SURNAME\n\
        GONZALEZ\n\
        NOMBRE / NAME\n\
        MARIA LAURA\n\
        SEXO / SEX\n\
        F\n\
        NACIONALIDAD / NATIONALITY ARGENTINA\n\
        FECHA DE NACIMIENTO / DATE OF BIRTH\n\
        15 ENE/ JAN 1990\n\
        DOCUMENTO / DOCUMENT 30.111.222\n\
        TRAMITE 00612345678\n";

    #[test]
    fn test_document_number_bounds() {
        assert_eq!(normalize_document_number("30.111.222"), Some("30111222".into()));
        assert_eq!(normalize_document_number("123456"), None);
        assert_eq!(normalize_document_number("1234567890"), None);
    }

    #[test]
    fn test_bilingual_dates() {
        assert_eq!(normalize_bilingual_date("15 ENE/ JAN 1990"), Some("15/01/1990".into()));
        assert_eq!(normalize_bilingual_date("3 SET 2001"), Some("03/09/2001".into()));
        assert_eq!(normalize_bilingual_date("1-2-2020"), Some("01/02/2020".into()));
        assert_eq!(normalize_bilingual_date("no date here"), None);
    }

    #[test]
    fn test_fuzzy_month_tolerates_ocr_noise() {
        assert_eq!(month_number("SEPTIEMBR"), Some("09"));
        assert_eq!(month_number("XYZ"), None);
    }

    #[test]
    fn test_value_after_label_skips_label_lines() {
        let lines = vec!["APELLIDO / SURNAME", "SEXO / SEX", "PEREZ"];
        assert_eq!(extract_value_after_label(&lines, &SURNAME_LABELS), None);
        let lines = vec!["APELLIDO / SURNAME", "PEREZ"];
        assert_eq!(extract_value_after_label(&lines, &SURNAME_LABELS), Some("Perez".into()));
    }

    #[test]
    fn test_document_number_ignores_tramite() {
        let lines = vec!["TRAMITE 12345678", "99887766"];
        assert_eq!(extract_document_number(&lines), Some("99887766".into()));
    }

    #[test]
    fn test_parse_front_text() {
        let fields = parse_dni_text(FRONT_TEXT);
        assert_eq!(fields["numero_documento"], "30111222");
        assert_eq!(fields["apellido"], "Gonzalez");
        assert_eq!(fields["nombre"], "Maria Laura");
        assert_eq!(fields["sexo"], "F");
        assert_eq!(fields["nacionalidad"], "ARGENTINA");
        assert_eq!(fields["fecha_nacimiento"], "15/01/1990");
        assert_eq!(fields["tramite"], "00612345678");
    }

    #[test]
    fn test_cuil_and_address() {
        let fields = parse_dni_text("CUIL: 27-30111222-4\nDomicilio: Av. Siempre Viva 742\n");
        assert_eq!(fields["cuil"], "27-30111222-4");
        assert_eq!(fields["domicilio"], "Av. Siempre Viva 742");
    }
}
