//! Machine-readable zone parsing (ICAO 9303 TD1, TD2 and TD3 layouts).

use crate::models::extraction::FieldMap;
use crate::services::text::title_case;

const TD1_WIDTH: usize = 30;
const TD2_WIDTH: usize = 36;
const TD3_WIDTH: usize = 44;
const MIN_ID_LINE: usize = 28;
const MIN_PASSPORT_LINE: usize = 40;

/// Two-digit years above this pivot belong to the 1900s.
const CENTURY_PIVOT: u32 = 50;

/// Upper-case and keep only MRZ alphabet characters.
pub fn clean_line(line: &str) -> String {
    line.to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '<')
        .collect()
}

/// Candidate MRZ lines of at least `min_len` characters, in reading order.
pub fn candidate_lines(text: &str, min_len: usize) -> Vec<String> {
    text.lines()
        .map(clean_line)
        .filter(|l| l.len() >= min_len && l.contains('<'))
        .collect()
}

/// ID-card MRZ from recognized text: the last three lines as TD1, else the last two as TD2.
pub fn parse_id_text(text: &str) -> Option<FieldMap> {
    let lines = candidate_lines(text, MIN_ID_LINE);
    let fields = match lines.len() {
        n if n >= 3 => parse_td1(&lines[n - 3], &lines[n - 2], &lines[n - 1]),
        2 => parse_td2(&lines[0], &lines[1]),
        _ => return None,
    };
    (!fields.is_empty()).then_some(fields)
}

/// Passport MRZ (TD3) from recognized text; the first two long lines are used.
pub fn parse_passport_text(text: &str) -> Option<FieldMap> {
    let lines = candidate_lines(text, MIN_PASSPORT_LINE);
    match lines.as_slice() {
        [first, second, ..] => Some(parse_td3(first, second)),
        _ => None,
    }
}

pub fn parse_td1(line1: &str, line2: &str, line3: &str) -> FieldMap {
    let (l1, l2, l3) = (pad(line1, TD1_WIDTH), pad(line2, TD1_WIDTH), pad(line3, TD1_WIDTH));
    let mut fields = FieldMap::new();

    put(&mut fields, "numero_documento", strip_fill(&l1[5..14]));
    let country = strip_fill(&l1[2..5]);
    if !country.is_empty() {
        if country == "ARG" {
            fields.insert("nacionalidad".into(), "ARGENTINA".into());
        }
        fields.insert("pais_emisor".into(), country);
    }
    if let Some(date) = format_date(&l2[0..6]) {
        fields.insert("fecha_nacimiento".into(), date);
    }
    put_sex(&mut fields, &l2[7..8]);
    if let Some(date) = format_date(&l2[8..14]) {
        fields.insert("fecha_vencimiento".into(), date);
    }
    let nationality = strip_fill(&l2[15..18]);
    if !nationality.is_empty() && !fields.contains_key("nacionalidad") {
        let value = if nationality == "ARG" { "ARGENTINA".to_string() } else { nationality };
        fields.insert("nacionalidad".into(), value);
    }
    put_names(&mut fields, &l3);
    fields
}

pub fn parse_td2(line1: &str, line2: &str) -> FieldMap {
    let (l1, l2) = (pad(line1, TD2_WIDTH), pad(line2, TD2_WIDTH));
    let mut fields = FieldMap::new();

    put_names(&mut fields, &l1[5..]);
    let country = strip_fill(&l1[2..5]);
    if !country.is_empty() {
        if country == "ARG" {
            fields.insert("nacionalidad".into(), "ARGENTINA".into());
        }
        fields.insert("pais_emisor".into(), country);
    }
    put(&mut fields, "numero_documento", strip_fill(&l2[0..9]));
    if let Some(date) = format_date(&l2[13..19]) {
        fields.insert("fecha_nacimiento".into(), date);
    }
    put_sex(&mut fields, &l2[20..21]);
    if let Some(date) = format_date(&l2[21..27]) {
        fields.insert("fecha_vencimiento".into(), date);
    }
    fields
}

pub fn parse_td3(line1: &str, line2: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("mrz_line1".into(), line1.to_string());
    fields.insert("mrz_line2".into(), line2.to_string());

    if line1.len() >= TD3_WIDTH {
        put(&mut fields, "codigo_pais", strip_fill(&line1[2..5]));
        let names = &line1[5..TD3_WIDTH];
        if let Some((surname, given)) = names.split_once("<<") {
            put(&mut fields, "apellido", surname.replace('<', " ").trim().to_string());
            put(&mut fields, "nombre", given.replace('<', " ").trim().to_string());
        }
    }
    if line2.len() >= TD3_WIDTH {
        put(&mut fields, "numero_pasaporte", strip_fill(&line2[0..9]));
        put(&mut fields, "nacionalidad", strip_fill(&line2[10..13]));
        if let Some(date) = format_date(&line2[13..19]) {
            fields.insert("fecha_nacimiento".into(), date);
        }
        put_sex(&mut fields, &line2[20..21]);
        if let Some(date) = format_date(&line2[21..27]) {
            fields.insert("fecha_vencimiento".into(), date);
        }
    }
    fields
}

/// `YYMMDD` → `DD/MM/YYYY` with the century pivot; `None` unless six digits.
pub fn format_date(raw: &str) -> Option<String> {
    if raw.len() != 6 || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let yy: u32 = raw[0..2].parse().ok()?;
    let century = if yy > CENTURY_PIVOT { "19" } else { "20" };
    Some(format!("{}/{}/{}{}", &raw[4..6], &raw[2..4], century, &raw[0..2]))
}

fn pad(line: &str, width: usize) -> String {
    let mut padded: String = line.chars().take(width).collect();
    while padded.len() < width {
        padded.push('<');
    }
    padded
}

fn strip_fill(value: &str) -> String {
    value.replace('<', "")
}

fn put(fields: &mut FieldMap, key: &str, value: String) {
    if !value.is_empty() {
        fields.insert(key.to_string(), value);
    }
}

fn put_sex(fields: &mut FieldMap, value: &str) {
    if matches!(value, "M" | "F") {
        fields.insert("sexo".into(), value.to_string());
    }
}

/// Names separated by `<<`: surname first, then given names.
fn put_names(fields: &mut FieldMap, raw: &str) {
    let spaced = raw.replace('<', " ");
    let parts: Vec<&str> = spaced
        .trim()
        .split("  ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if let Some(surname) = parts.first() {
        fields.insert("apellido".into(), title_case(surname));
    }
    if parts.len() >= 2 {
        fields.insert("nombre".into(), title_case(&parts[1..].join(" ")));
    }
}
