//! Identity document intelligence pipeline
//!
//! Turns photographs of Argentine DNI cards, passports and driver's licenses
//! into structured field data with a calibrated confidence score. Uploads are
//! queued per document type, extracted by workers that classify the layout,
//! read barcodes, MRZ and printed text, fuse the sources, and publish the
//! result for signed webhook delivery.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
