//! Masking for personal data and credentials that leave the worker (logs, dead letters).

use sha2::{Digest, Sha256};

use crate::models::extraction::FieldMap;

/// `30111222` → `*****222`.
pub fn mask_document_number(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(char::is_ascii_alphanumeric).collect();
    let keep = digits.len().min(3);
    let hidden = digits.len() - keep;
    "*".repeat(hidden) + &digits[hidden..].iter().collect::<String>()
}

/// `27-30111222-4` → `**-********-4`.
pub fn mask_cuil(value: &str) -> String {
    let last_digit = value.rfind(|c: char| c.is_ascii_digit());
    value
        .char_indices()
        .map(|(i, c)| match c {
            '-' => '-',
            _ if Some(i) == last_digit => c,
            _ => '*',
        })
        .collect()
}

/// Initial only: `Maria Laura` → `M.`.
pub fn mask_name(value: &str) -> String {
    match value.trim().chars().next() {
        Some(initial) => format!("{initial}."),
        None => String::new(),
    }
}

/// Length plus a short digest, for payloads that must never be logged (MRZ lines, barcodes).
pub fn fingerprint(value: &str) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    format!("len={} sha256={}", value.len(), &digest[..12])
}

/// Message keys whose values are credentials.
const SECRET_KEYS: &[&str] = &["webhook_secret"];

pub const REDACTED: &str = "[redacted]";

/// Copy of a message body with credential values replaced, at any depth.
pub fn redact_secrets(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let redacted = if SECRET_KEYS.contains(&key.as_str()) && !inner.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_secrets(inner)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_secrets).collect()),
        other => other.clone(),
    }
}

/// Copy of `fields` safe to log.
pub fn mask_fields(fields: &FieldMap) -> FieldMap {
    fields
        .iter()
        .map(|(key, value)| {
            let masked = match key.as_str() {
                "numero_documento" | "numero_pasaporte" | "numero_licencia" | "tramite" => {
                    mask_document_number(value)
                }
                "cuil" => mask_cuil(value),
                "apellido" | "nombre" => mask_name(value),
                "mrz_line1" | "mrz_line2" | "domicilio" => fingerprint(value),
                _ => value.clone(),
            };
            (key.clone(), masked)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_number_keeps_last_three() {
        assert_eq!(mask_document_number("30.111.222"), "*****222");
        assert_eq!(mask_document_number("12"), "12");
    }

    #[test]
    fn test_cuil_keeps_check_digit() {
        assert_eq!(mask_cuil("27-30111222-4"), "**-********-4");
    }

    #[test]
    fn test_fingerprint_hides_content() {
        let mrz = "IDARG30111222<4<<<<<<<<<<<<<<<";
        let fp = fingerprint(mrz);
        assert!(fp.starts_with("len=30 sha256="));
        assert!(!fp.contains("30111222"));
    }

    #[test]
    fn test_mask_fields_leaves_dates() {
        let fields = FieldMap::from([
            ("apellido".to_string(), "Gonzalez".to_string()),
            ("fecha_nacimiento".to_string(), "15/03/1985".to_string()),
        ]);
        let masked = mask_fields(&fields);
        assert_eq!(masked["apellido"], "G.");
        assert_eq!(masked["fecha_nacimiento"], "15/03/1985");
    }

    #[test]
    fn test_redact_secrets_at_any_depth() {
        let body = serde_json::json!({
            "document_id": "d-1",
            "webhook_url": "https://hooks.example.com/kyc",
            "webhook_secret": "s3cret",
            "original_message": {"webhook_secret": "older", "frames": [{"webhook_secret": "nested"}]},
        });
        let redacted = redact_secrets(&body);
        let text = redacted.to_string();
        assert!(!text.contains("s3cret"));
        assert!(!text.contains("older"));
        assert!(!text.contains("nested"));
        assert_eq!(redacted["webhook_secret"], REDACTED);
        assert_eq!(redacted["webhook_url"], "https://hooks.example.com/kyc");
        assert_eq!(redacted["document_id"], "d-1");
    }

    #[test]
    fn test_redact_keeps_absent_secret_null() {
        let body = serde_json::json!({"webhook_secret": null});
        assert!(redact_secrets(&body)["webhook_secret"].is_null());
    }
}
