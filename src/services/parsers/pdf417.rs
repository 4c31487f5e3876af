//! `@`-delimited payload carried by the PDF417 barcode on Argentine DNIs.
//!
//! Two layouts exist. Current cards start with the trámite number:
//! `tramite@APELLIDO@NOMBRE@SEXO@DNI@EJEMPLAR@NACIMIENTO@EMISION[@CUIL]`.
//! Older cards open with a separator and shift every field:
//! `@DNI@EJEMPLAR@?@APELLIDO@NOMBRE@NACIONALIDAD@NACIMIENTO@SEXO@EMISION@CUIL@?@VENCIMIENTO`.

use crate::models::extraction::FieldMap;
use crate::services::text::{normalize_document_number, title_case};

const NEW_FORMAT_MIN_PARTS: usize = 8;
const OLD_FORMAT_MIN_PARTS: usize = 10;
const OLD_FORMAT_REQUIRED_PARTS: usize = 11;

/// Parse a raw payload. Unrecognized layouts yield an empty map.
pub fn parse(raw: &str) -> FieldMap {
    let parts: Vec<&str> = raw.split('@').map(str::trim).collect();
    if raw.starts_with('@') && parts.len() >= OLD_FORMAT_MIN_PARTS {
        parse_old_format(&parts)
    } else if parts.len() >= NEW_FORMAT_MIN_PARTS {
        parse_new_format(&parts)
    } else {
        FieldMap::new()
    }
}

fn parse_new_format(parts: &[&str]) -> FieldMap {
    let mut fields = FieldMap::new();
    insert_non_empty(&mut fields, "tramite", parts[0].to_string());
    insert_non_empty(&mut fields, "apellido", title_case(parts[1]));
    insert_non_empty(&mut fields, "nombre", title_case(parts[2]));
    if is_sex(parts[3]) {
        fields.insert("sexo".into(), parts[3].to_string());
    }
    if let Some(number) = normalize_document_number(parts[4]) {
        fields.insert("numero_documento".into(), number);
    }
    insert_non_empty(&mut fields, "ejemplar", parts[5].to_string());
    insert_non_empty(&mut fields, "fecha_nacimiento", normalize_date(parts[6]));
    insert_non_empty(&mut fields, "fecha_emision", normalize_date(parts[7]));
    if let Some(cuil) = parts.get(8).filter(|c| is_cuil(c)) {
        fields.insert("cuil".into(), cuil.to_string());
    }
    fields
}

fn parse_old_format(parts: &[&str]) -> FieldMap {
    let mut fields = FieldMap::new();
    if parts.len() < OLD_FORMAT_REQUIRED_PARTS {
        return fields;
    }
    if let Some(number) = normalize_document_number(parts[1]) {
        fields.insert("numero_documento".into(), number);
    }
    insert_non_empty(&mut fields, "ejemplar", parts[2].to_string());
    insert_non_empty(&mut fields, "apellido", title_case(parts[4]));
    insert_non_empty(&mut fields, "nombre", title_case(parts[5]));
    if parts[6].to_uppercase().contains("ARGENTIN") {
        fields.insert("nacionalidad".into(), "ARGENTINA".into());
    }
    insert_non_empty(&mut fields, "fecha_nacimiento", normalize_date(parts[7]));
    if is_sex(parts[8]) {
        fields.insert("sexo".into(), parts[8].to_string());
    }
    insert_non_empty(&mut fields, "fecha_emision", normalize_date(parts[9]));
    if is_cuil(parts[10]) {
        fields.insert("cuil".into(), parts[10].to_string());
    }
    if let Some(expiry) = parts.get(12) {
        insert_non_empty(&mut fields, "fecha_vencimiento", normalize_date(expiry));
    }
    fields
}

/// `DDMMYYYY` → `DD/MM/YYYY`; anything else passes through.
pub fn normalize_date(raw: &str) -> String {
    if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("{}/{}/{}", &raw[0..2], &raw[2..4], &raw[4..8])
    } else {
        raw.to_string()
    }
}

fn is_sex(value: &str) -> bool {
    matches!(value, "M" | "F")
}

fn is_cuil(value: &str) -> bool {
    !value.is_empty() && (value.contains('-') || value.len() == 11)
}

fn insert_non_empty(fields: &mut FieldMap, key: &str, value: String) {
    if !value.is_empty() {
        fields.insert(key.to_string(), value);
    }
}
