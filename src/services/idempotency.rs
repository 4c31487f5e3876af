//! Upload idempotency keys.
//!
//! The same picture re-saved by another app (different EXIF, PNG vs JPEG)
//! must map to the same key, so images are hashed after canonicalization:
//! decode, drop alpha and metadata, re-encode as JPEG at a fixed quality.

use image::codecs::jpeg::JpegEncoder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::document::DocumentType;

const CANONICAL_JPEG_QUALITY: u8 = 85;

/// SHA-256 hex of the canonical image; raw bytes when the image does not decode.
pub fn canonical_image_hash(bytes: &[u8]) -> String {
    match canonical_jpeg(bytes) {
        Some(canonical) => hex::encode(Sha256::digest(&canonical)),
        None => {
            debug!(len = bytes.len(), "image not decodable, hashing raw bytes");
            hex::encode(Sha256::digest(bytes))
        }
    }
}

fn canonical_jpeg(bytes: &[u8]) -> Option<Vec<u8>> {
    let rgb = image::load_from_memory(bytes).ok()?.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, CANONICAL_JPEG_QUALITY)
        .encode_image(&rgb)
        .ok()?;
    Some(out)
}

/// `sha256("{client_id}:{document_type}:{canonical image hash}")`.
pub fn idempotency_key(client_id: &str, document_type: DocumentType, image: &[u8]) -> String {
    let material = format!("{client_id}:{document_type}:{}", canonical_image_hash(image));
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Key that never collides with an earlier submission.
pub fn forced_key(key: &str, unix_millis: i64) -> String {
    format!("{key}_{unix_millis}")
}
