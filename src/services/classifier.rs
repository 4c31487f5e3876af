//! Label-free variant classification for DNI images.
//!
//! Four independent layout signals are scored in `[0, 1]` and then resolved by
//! a fixed priority cascade: a barcode beats an MRZ, which beats the generic
//! front layout, which beats the legacy layout. A lower-priority signal never
//! wins over a higher-priority one that clears its threshold.

use image::{imageops, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::extraction::Variant;
use crate::services::imaging::{self, Roi};

pub const PDF417_THRESHOLD: f64 = 0.55;
pub const MRZ_THRESHOLD: f64 = 0.60;
pub const FRONT_THRESHOLD: f64 = 0.60;
pub const LEGACY_THRESHOLD: f64 = 0.60;

/// Raw scores behind a classification, kept for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicSignals {
    pub pdf417: f64,
    pub mrz: f64,
    pub front_layout: f64,
    pub legacy_layout: f64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub variant: Variant,
    pub confidence: f64,
    pub signals: HeuristicSignals,
}

#[derive(Debug, Clone, Default)]
pub struct VariantClassifier;

impl VariantClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, image: &RgbImage) -> Classification {
        if image.width() == 0 || image.height() == 0 {
            return Classification {
                variant: Variant::Unknown,
                confidence: 0.0,
                signals: HeuristicSignals {
                    notes: vec!["invalid input image".to_string()],
                    ..Default::default()
                },
            };
        }

        let gray = imaging::to_gray(image);
        let mut signals = HeuristicSignals {
            pdf417: pdf417_signal(&gray),
            mrz: mrz_signal(&gray),
            front_layout: front_layout_signal(image, &gray),
            legacy_layout: legacy_layout_signal(image, &gray),
            notes: Vec::new(),
        };
        for (score, threshold, note) in [
            (signals.pdf417, PDF417_THRESHOLD, "PDF417 barcode detected"),
            (signals.mrz, MRZ_THRESHOLD, "MRZ geometry detected"),
            (signals.front_layout, FRONT_THRESHOLD, "DNI front features detected"),
            (signals.legacy_layout, LEGACY_THRESHOLD, "DNI old format detected"),
        ] {
            if score >= threshold {
                signals.notes.push(note.to_string());
            }
        }

        let (variant, confidence) = decide(&signals);
        debug!(
            variant = %variant,
            confidence,
            pdf417 = signals.pdf417,
            mrz = signals.mrz,
            front = signals.front_layout,
            legacy = signals.legacy_layout,
            "variant classified"
        );
        Classification {
            variant,
            confidence,
            signals,
        }
    }
}

/// Priority cascade over the signal scores.
pub fn decide(signals: &HeuristicSignals) -> (Variant, f64) {
    if signals.pdf417 >= PDF417_THRESHOLD {
        return (Variant::DniNewBack, signals.pdf417);
    }
    if signals.mrz >= MRZ_THRESHOLD {
        return (Variant::DniNewFront, signals.mrz);
    }
    if signals.front_layout >= FRONT_THRESHOLD {
        return (Variant::DniNewFront, signals.front_layout);
    }
    if signals.legacy_layout >= LEGACY_THRESHOLD {
        return (Variant::DniOld, signals.legacy_layout);
    }
    let best = [signals.pdf417, signals.mrz, signals.front_layout, signals.legacy_layout]
        .into_iter()
        .fold(0.0, f64::max);
    (Variant::Unknown, best)
}

// ── PDF417 ──────────────────────────────────────────────────────────

const PDF417_ROI_X: f64 = 0.55;
const PDF417_ROI_Y: f64 = 0.50;

fn pdf417_signal(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    let x0 = (w as f64 * PDF417_ROI_X) as u32;
    let y0 = (h as f64 * PDF417_ROI_Y) as u32;
    if x0 >= w || y0 >= h {
        return 0.0;
    }
    let roi = imageops::crop_imm(gray, x0, y0, w - x0, h - y0).to_image();
    let binary = imaging::otsu_binarize(&roi, false);

    let score = 0.4 * barcode_density(&binary)
        + 0.3 * row_repetition(&binary)
        + 0.15 * position_score(x0 as f64 / w as f64, y0 as f64 / h as f64)
        + 0.15 * barcode_aspect(roi.width(), roi.height());
    score.min(1.0)
}

fn barcode_density(binary: &GrayImage) -> f64 {
    let black = binary.pixels().filter(|p| p[0] == 0).count() as f64;
    let white = binary.pixels().filter(|p| p[0] == 255).count() as f64;
    let max = black.max(white);
    if max == 0.0 {
        return 0.0;
    }
    let r = black.min(white) / max;
    if r > 0.35 && r < 0.65 {
        r * 1.5
    } else {
        r * 0.8
    }
}

/// Stacked barcode rows show many, evenly repeated horizontal transitions.
fn row_repetition(binary: &GrayImage) -> f64 {
    let (w, h) = binary.dimensions();
    if h < 10 || w < 20 {
        return 0.0;
    }
    let transitions = (0..h.min(50)).map(|y| {
        (1..w)
            .filter(|&x| binary.get_pixel(x, y)[0].abs_diff(binary.get_pixel(x - 1, y)[0]) > 127)
            .count() as f64
    });
    let (mean, std) = imaging::mean_std(transitions);
    if mean < 15.0 {
        return 0.0;
    }
    let consistency = 1.0 - std / mean;
    let density = (mean / 80.0).min(1.0);
    (0.6 * consistency + 0.4 * density).min(1.0)
}

fn position_score(x_ratio: f64, y_ratio: f64) -> f64 {
    if x_ratio >= 0.55 && y_ratio >= 0.50 {
        1.0
    } else if x_ratio >= 0.45 && y_ratio >= 0.40 {
        0.7
    } else {
        0.3
    }
}

fn barcode_aspect(w: u32, h: u32) -> f64 {
    if h == 0 {
        return 0.0;
    }
    let aspect = w as f64 / h as f64;
    if (2.5..=3.5).contains(&aspect) {
        1.0
    } else if (2.0..=4.0).contains(&aspect) {
        0.6
    } else {
        0.2
    }
}

// ── MRZ ─────────────────────────────────────────────────────────────

const MRZ_ROI_Y: f64 = 0.70;
/// Row gap bridged when grouping ink rows into one band.
const BAND_ROW_GAP: u32 = 4;
/// Column gap bridged when measuring a band's horizontal run.
const BAND_COLUMN_GAP: u32 = 28;

/// A horizontal text band: top row, height and widest continuous ink run.
#[derive(Debug, Clone, Copy)]
struct Band {
    top: u32,
    height: u32,
    extent: u32,
}

fn mrz_signal(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    let y0 = (h as f64 * MRZ_ROI_Y) as u32;
    if y0 >= h {
        return 0.0;
    }
    let roi = imageops::crop_imm(gray, 0, y0, w, h - y0).to_image();
    let ink = imaging::otsu_binarize(&roi, true);

    let mut strips: Vec<Band> = text_bands(&ink)
        .into_iter()
        .filter(|b| {
            let aspect = b.extent as f64 / b.height as f64;
            aspect > 8.0 && b.extent as f64 / w as f64 > 0.6
        })
        .collect();

    match strips.len() {
        0 => 0.0,
        1 => 0.40,
        _ => {
            strips.sort_by_key(|b| b.top);
            let tops: Vec<f64> = strips.iter().take(3).map(|b| b.top as f64).collect();
            let gaps = tops.windows(2).map(|p| p[1] - p[0]);
            let (_, std) = imaging::mean_std(gaps);
            if std < 15.0 {
                0.85
            } else {
                0.70
            }
        }
    }
}

/// Row-projection bands of ink, each measured by its widest horizontal run.
fn text_bands(ink: &GrayImage) -> Vec<Band> {
    let (w, h) = ink.dimensions();
    let has_ink = |y: u32| (0..w).any(|x| ink.get_pixel(x, y)[0] > 0);

    let mut bands = Vec::new();
    let mut y = 0;
    while y < h {
        if !has_ink(y) {
            y += 1;
            continue;
        }
        let top = y;
        let mut bottom = y;
        let mut gap = 0;
        y += 1;
        while y < h && gap <= BAND_ROW_GAP {
            if has_ink(y) {
                bottom = y;
                gap = 0;
            } else {
                gap += 1;
            }
            y += 1;
        }
        bands.push(Band {
            top,
            height: bottom - top + 1,
            extent: widest_run(ink, top, bottom),
        });
    }
    bands
}

fn widest_run(ink: &GrayImage, top: u32, bottom: u32) -> u32 {
    let w = ink.width();
    let mut best = 0;
    let mut start: Option<u32> = None;
    let mut last_ink = 0;
    for x in 0..w {
        if !(top..=bottom).any(|y| ink.get_pixel(x, y)[0] > 0) {
            continue;
        }
        match start {
            Some(_) if x - last_ink <= BAND_COLUMN_GAP => {}
            _ => start = Some(x),
        }
        last_ink = x;
        if let Some(s) = start {
            best = best.max(x - s + 1);
        }
    }
    best
}

// ── Layout signals ──────────────────────────────────────────────────

const PHOTO_ROI: Roi = Roi::new(0.05, 0.15, 0.35, 0.65);
const SIGNATURE_ROI: Roi = Roi::new(0.50, 0.55, 0.50, 0.45);
const LEGACY_PHOTO_ROI: Roi = Roi::new(0.60, 0.0, 0.40, 1.0);
const LEGACY_TEXT_ROI: Roi = Roi::new(0.0, 0.0, 0.55, 0.60);

fn front_layout_signal(image: &RgbImage, gray: &GrayImage) -> f64 {
    let (w, h) = image.dimensions();
    let mut score: f64 = 0.0;

    let photo = imaging::crop_rgb(image, PHOTO_ROI);
    if photo.width() > 0 && photo.height() > 0 {
        let skin = imaging::skin_ratio(&photo);
        if skin > 0.15 {
            score += 0.35;
        } else if skin > 0.08 {
            score += 0.20;
        }
        let (_, _, pw, ph) = PHOTO_ROI.to_pixels(w, h);
        let aspect = pw as f64 / ph as f64;
        if aspect > 0.65 && aspect < 0.85 {
            score += 0.10;
        }
    }

    let signature = imaging::crop_gray(gray, SIGNATURE_ROI);
    score += signature_texture(&signature) * 0.20;
    score += hologram_presence(image) * 0.20;
    score += card_structure(w, h) * 0.15;
    score.min(1.0)
}

/// Handwriting shows a moderate edge density split over a handful of strokes.
fn signature_texture(gray: &GrayImage) -> f64 {
    if gray.width() == 0 || gray.height() == 0 {
        return 0.0;
    }
    let edges = imaging::edges(gray, 50.0, 150.0);
    let density = imaging::ratio(edges.pixels(), |p| p[0] > 0);
    if density <= 0.03 || density >= 0.20 {
        return 0.0;
    }
    match imaging::components(&edges).len() {
        n if n > 5 && n < 100 => 0.8,
        n if n > 2 => 0.5,
        _ => 0.0,
    }
}

fn hologram_presence(image: &RgbImage) -> f64 {
    let ratio = imaging::ratio(image.pixels(), |p| {
        let [_, s, v] = imaging::rgb_to_hsv(p);
        s > 100 && v > 180
    });
    if ratio > 0.015 {
        0.7
    } else if ratio > 0.008 {
        0.4
    } else {
        0.0
    }
}

fn card_structure(w: u32, h: u32) -> f64 {
    let aspect = w as f64 / h as f64;
    if aspect > 1.4 && aspect < 1.7 {
        0.8
    } else if aspect > 1.3 && aspect < 1.8 {
        0.5
    } else {
        0.2
    }
}

fn legacy_layout_signal(image: &RgbImage, gray: &GrayImage) -> f64 {
    let (w, h) = image.dimensions();
    let mut score: f64 = 0.0;

    let (_, std) = imaging::gray_mean_std(gray);
    if std < 45.0 {
        score += 0.25;
    } else if std < 55.0 {
        score += 0.15;
    }

    let photo = imaging::crop_rgb(image, LEGACY_PHOTO_ROI);
    let skin = imaging::skin_ratio(&photo);
    if skin > 0.12 {
        score += 0.30;
    } else if skin > 0.06 {
        score += 0.15;
    }

    let text = imaging::crop_gray(gray, LEGACY_TEXT_ROI);
    if text.width() > 0 && text.height() > 0 {
        let density = imaging::edge_density(&text, 50.0, 150.0);
        if density > 0.02 && density < 0.15 {
            score += 0.25;
        }
    }

    let aspect = w as f64 / h as f64;
    if aspect > 1.4 && aspect < 1.7 {
        score += 0.10;
    }
    score.min(1.0)
}
