//! Pure decoders for structured payloads. No I/O.

pub mod mrz;
pub mod pdf417;
