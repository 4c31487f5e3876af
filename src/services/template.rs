//! Per-zone verification against the known DNI print layouts.
//!
//! Each layout lists percentage boxes per card side and the checks that apply
//! inside each box. The verifier never fails: an unknown layout or a side with
//! no zones comes back as [`Analysis::Unavailable`].

use image::{imageops, GrayImage, RgbImage};
use tracing::debug;

use crate::models::analysis::{Analysis, TemplateReport, ZoneResult};
use crate::models::extraction::{Side, Variant};
use crate::services::imaging::{self, Roi};

const MIN_ZONE_PX: u32 = 10;
const ZONE_PASS_SCORE: f64 = 0.5;
const MAX_FLAGS: usize = 10;
const DEFAULT_TEMPLATE: &str = "nuevo_2019";

const FRONT_CRITICAL: &[&str] = &["photo", "document_number", "barcode_pdf417", "hologram_sun"];
const BACK_CRITICAL: &[&str] = &["mrz", "fingerprint", "hologram_circle", "cuil"];

/// Verification method run inside a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Saturation,
    Iridescence,
    ColorVariance,
    FaceDetection,
    BorderIntegrity,
    FingerprintPresence,
    TextPresence,
    BarcodeDecode,
    ShapeRecognition,
    ColorCheck,
    PatternPresence,
}

#[derive(Debug)]
pub struct Zone {
    pub name: &'static str,
    /// `[x, y, w, h]` in percent of the image size.
    pub coords: [f64; 4],
    pub checks: &'static [Check],
    pub optional: bool,
}

#[derive(Debug)]
pub struct Layout {
    pub name: &'static str,
    pub front: &'static [Zone],
    pub back: &'static [Zone],
}

impl Layout {
    fn zones(&self, side: Side) -> &'static [Zone] {
        match side {
            Side::Front => self.front,
            Side::Back => self.back,
        }
    }
}

const fn zone(name: &'static str, coords: [f64; 4], checks: &'static [Check]) -> Zone {
    Zone {
        name,
        coords,
        checks,
        optional: false,
    }
}

const fn optional_zone(name: &'static str, coords: [f64; 4], checks: &'static [Check]) -> Zone {
    Zone {
        name,
        coords,
        checks,
        optional: true,
    }
}

use Check::*;

const NEW_FRONT: &[Zone] = &[
    zone("photo", [4.0, 18.0, 30.0, 62.0], &[FaceDetection, BorderIntegrity]),
    zone("document_number", [36.0, 66.0, 30.0, 10.0], &[TextPresence]),
    zone("names", [36.0, 22.0, 55.0, 28.0], &[TextPresence]),
    zone("hologram_sun", [62.0, 44.0, 16.0, 24.0], &[Iridescence, Saturation]),
    zone("barcode_pdf417", [66.0, 74.0, 32.0, 22.0], &[BarcodeDecode]),
    zone("argentina_map", [84.0, 4.0, 13.0, 18.0], &[ShapeRecognition]),
    optional_zone("signature", [36.0, 80.0, 26.0, 16.0], &[TextPresence]),
];

const NEW_BACK: &[Zone] = &[
    zone("cuil", [4.0, 8.0, 40.0, 10.0], &[TextPresence]),
    zone("address", [4.0, 20.0, 50.0, 24.0], &[TextPresence]),
    zone("hologram_circle", [36.0, 25.0, 26.0, 30.0], &[Iridescence, ColorVariance]),
    zone("fingerprint", [70.0, 8.0, 24.0, 40.0], &[FingerprintPresence]),
    zone("mrz", [3.0, 72.0, 94.0, 26.0], &[TextPresence]),
];

const NEW_2016_FRONT: &[Zone] = &[
    zone("photo", [4.0, 18.0, 30.0, 62.0], &[FaceDetection, BorderIntegrity]),
    zone("document_number", [36.0, 66.0, 30.0, 10.0], &[TextPresence]),
    zone("names", [36.0, 22.0, 55.0, 28.0], &[TextPresence]),
    zone("hologram_sun", [34.0, 40.0, 30.0, 30.0], &[Iridescence, FaceDetection]),
    zone("barcode_pdf417", [66.0, 74.0, 32.0, 22.0], &[BarcodeDecode]),
    zone("argentina_map", [84.0, 4.0, 13.0, 18.0], &[ShapeRecognition]),
];

const NEW_2023_FRONT: &[Zone] = &[
    zone("photo", [4.0, 18.0, 30.0, 62.0], &[FaceDetection, BorderIntegrity]),
    zone("document_number", [36.0, 66.0, 30.0, 10.0], &[TextPresence]),
    zone("names", [36.0, 22.0, 55.0, 28.0], &[TextPresence]),
    zone("hologram_sun", [62.0, 44.0, 16.0, 24.0], &[Iridescence, Saturation]),
    zone("barcode_pdf417", [66.0, 74.0, 32.0, 22.0], &[BarcodeDecode]),
    zone("pink_decorative", [0.0, 0.0, 100.0, 8.0], &[ColorCheck]),
];

const NEW_2023_BACK: &[Zone] = &[
    zone("cuil", [4.0, 8.0, 40.0, 10.0], &[TextPresence]),
    zone("hologram_circle", [36.0, 25.0, 26.0, 30.0], &[Iridescence, ColorVariance]),
    zone("fingerprint", [70.0, 8.0, 24.0, 40.0], &[FingerprintPresence]),
    zone("mrz", [3.0, 72.0, 94.0, 26.0], &[TextPresence]),
    zone("pink_decorative", [0.0, 60.0, 100.0, 10.0], &[ColorCheck]),
];

const OLD_FRONT: &[Zone] = &[
    zone("photo", [55.0, 8.0, 40.0, 58.0], &[FaceDetection, BorderIntegrity]),
    zone("document_number", [5.0, 12.0, 40.0, 10.0], &[TextPresence]),
    zone("names", [5.0, 26.0, 45.0, 30.0], &[TextPresence]),
    zone("background_pattern", [0.0, 0.0, 100.0, 100.0], &[PatternPresence]),
    optional_zone("signature", [5.0, 70.0, 40.0, 20.0], &[TextPresence]),
];

const OLD_BACK: &[Zone] = &[
    zone("address", [5.0, 40.0, 60.0, 25.0], &[TextPresence]),
    zone("fingerprint", [5.0, 8.0, 25.0, 32.0], &[FingerprintPresence]),
    zone("mrz", [3.0, 74.0, 94.0, 24.0], &[TextPresence]),
];

pub static LAYOUTS: &[Layout] = &[
    Layout {
        name: "nuevo_2016",
        front: NEW_2016_FRONT,
        back: NEW_BACK,
    },
    Layout {
        name: "nuevo_2019",
        front: NEW_FRONT,
        back: NEW_BACK,
    },
    Layout {
        name: "nuevo_2023",
        front: NEW_2023_FRONT,
        back: NEW_2023_BACK,
    },
    Layout {
        name: "antiguo",
        front: OLD_FRONT,
        back: OLD_BACK,
    },
];

/// Layout implied by a classifier variant, when it pins one down.
pub fn template_for(variant: Variant) -> Option<&'static str> {
    match variant {
        Variant::DniOld => Some("antiguo"),
        _ => None,
    }
}

// ── Verifier ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TemplateVerifier;

impl TemplateVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify(&self, image: &RgbImage, side: Side, template: Option<&str>) -> Analysis<TemplateReport> {
        let name = match template {
            Some(name) => name.to_string(),
            None => detect_template(image, side).to_string(),
        };
        let Some(layout) = LAYOUTS.iter().find(|l| l.name == name) else {
            return Analysis::unavailable(format!("unknown_variant: {name}"));
        };
        let zones = layout.zones(side);
        if zones.is_empty() {
            return Analysis::unavailable(format!("no_zones_defined: {name}/{side}"));
        }

        let (w, h) = image.dimensions();
        let mut results = Vec::new();
        let mut total = 0.0;
        let mut analysed = 0usize;

        for zone in zones.iter().filter(|z| !z.optional) {
            let Some((x, y, zw, zh)) = clip_zone(zone.coords, w, h) else {
                results.push(ZoneResult {
                    zone: zone.name.to_string(),
                    score: 0.0,
                    verified: false,
                    flags: vec!["zone_too_small".to_string()],
                });
                continue;
            };
            let crop = imageops::crop_imm(image, x, y, zw, zh).to_image();
            let (score, flags) = verify_zone(zone, &crop);
            total += score;
            analysed += 1;
            results.push(ZoneResult {
                zone: zone.name.to_string(),
                score: round2(score),
                verified: score >= ZONE_PASS_SCORE,
                flags,
            });
        }

        let score = if analysed > 0 { total / analysed as f64 } else { 0.0 };
        let critical = match side {
            Side::Front => FRONT_CRITICAL,
            Side::Back => BACK_CRITICAL,
        };
        let critical_zones_passed = results
            .iter()
            .filter(|r| critical.contains(&r.zone.as_str()))
            .all(|r| r.verified);
        let flags = report_flags(&results, critical_zones_passed);

        debug!(template = %name, side = %side, score, analysed, "template zones verified");
        Analysis::Available(TemplateReport {
            template: name,
            side,
            score: round2(score),
            critical_zones_passed,
            zones: results,
            flags,
        })
    }
}

/// Pixel rectangle for a percentage box, or `None` when under 10px on a side.
fn clip_zone(coords: [f64; 4], w: u32, h: u32) -> Option<(u32, u32, u32, u32)> {
    if w == 0 || h == 0 {
        return None;
    }
    let x = ((w as f64 * coords[0] / 100.0) as u32).min(w - 1);
    let y = ((h as f64 * coords[1] / 100.0) as u32).min(h - 1);
    let zw = ((w as f64 * coords[2] / 100.0) as u32).min(w - x);
    let zh = ((h as f64 * coords[3] / 100.0) as u32).min(h - y);
    (zw >= MIN_ZONE_PX && zh >= MIN_ZONE_PX).then_some((x, y, zw, zh))
}

fn verify_zone(zone: &Zone, crop: &RgbImage) -> (f64, Vec<String>) {
    if zone.checks.is_empty() {
        return basic_zone_check(crop);
    }
    let mut total = 0.0;
    let mut flags = Vec::new();
    for check in zone.checks {
        let (score, flag) = run_check(*check, zone.name, crop);
        total += score;
        if let Some(flag) = flag {
            flags.push(flag.to_string());
        }
    }
    (total / zone.checks.len() as f64, flags)
}

fn report_flags(results: &[ZoneResult], critical_passed: bool) -> Vec<String> {
    let mut flags = Vec::new();
    if !critical_passed {
        flags.push("critical_zones_failed".to_string());
    }
    let failed = results.iter().filter(|r| !r.verified).count();
    if failed as f64 > results.len() as f64 / 2.0 {
        flags.push("majority_zones_failed".to_string());
    }
    for result in results {
        for flag in &result.flags {
            let tagged = format!("{}:{}", result.zone, flag);
            if !flags.contains(&tagged) {
                flags.push(tagged);
            }
        }
    }
    flags.truncate(MAX_FLAGS);
    flags
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ── Zone checks ─────────────────────────────────────────────────────

type CheckOutcome = (f64, Option<&'static str>);

fn run_check(check: Check, zone: &str, crop: &RgbImage) -> CheckOutcome {
    match check {
        Saturation => saturation_check(crop),
        Iridescence => iridescence_check(crop),
        ColorVariance => color_variance_check(crop),
        FaceDetection => face_check(crop),
        BorderIntegrity => border_check(&imaging::to_gray(crop)),
        FingerprintPresence => fingerprint_check(&imaging::to_gray(crop)),
        TextPresence => text_check(&imaging::to_gray(crop)),
        BarcodeDecode => barcode_check(&imaging::to_gray(crop)),
        ShapeRecognition => shape_check(crop, zone),
        ColorCheck => expected_color_check(crop, zone),
        PatternPresence => pattern_check(crop),
    }
}

fn hsv_channel(hsv: &RgbImage, c: usize) -> impl Iterator<Item = f64> + '_ {
    hsv.pixels().map(move |p| p[c] as f64)
}

fn saturation_check(crop: &RgbImage) -> CheckOutcome {
    let hsv = imaging::to_hsv(crop);
    let (mean, _) = imaging::mean_std(hsv_channel(&hsv, 1));
    let high = imaging::ratio(hsv.pixels(), |p| p[1] > 80);
    if high > 0.1 && mean > 40.0 {
        (0.9, None)
    } else if high > 0.05 || mean > 30.0 {
        (0.6, Some("low_saturation"))
    } else {
        (0.3, Some("very_low_saturation"))
    }
}

fn iridescence_check(crop: &RgbImage) -> CheckOutcome {
    let hue_var = imaging::variance(hsv_channel(&imaging::to_hsv(crop), 0));
    if hue_var > 500.0 {
        (0.9, None)
    } else if hue_var > 200.0 {
        (0.7, None)
    } else {
        (0.4, Some("low_hue_variance"))
    }
}

fn color_variance_check(crop: &RgbImage) -> CheckOutcome {
    let hsv = imaging::to_hsv(crop);
    let v = imaging::variance(hsv_channel(&hsv, 0)) + imaging::variance(hsv_channel(&hsv, 1));
    if v > 1000.0 {
        (0.9, None)
    } else if v > 300.0 {
        (0.6, None)
    } else {
        (0.3, Some("low_color_variance"))
    }
}

fn face_check(crop: &RgbImage) -> CheckOutcome {
    let density = imaging::edge_density(&imaging::to_gray(crop), 50.0, 150.0);
    let color_var = imaging::variance(crop.as_raw().iter().map(|&v| v as f64));
    if density > 0.05 && color_var > 500.0 {
        (0.8, None)
    } else if density > 0.02 {
        (0.5, Some("weak_photo_signal"))
    } else {
        (0.2, Some("no_face_detected"))
    }
}

fn border_check(gray: &GrayImage) -> CheckOutcome {
    let (w, h) = gray.dimensions();
    let band = 5.min(w).min(h);
    let strip_var = |x: u32, y: u32, sw: u32, sh: u32| {
        let strip = imageops::crop_imm(gray, x, y, sw, sh).to_image();
        imaging::variance(strip.pixels().map(|p| p[0] as f64))
    };
    let total = strip_var(0, 0, w, band)
        + strip_var(0, h - band, w, band)
        + strip_var(0, 0, band, h)
        + strip_var(w - band, 0, band, h);
    if total < 5000.0 {
        (0.8, None)
    } else {
        (0.5, Some("irregular_borders"))
    }
}

fn fingerprint_check(gray: &GrayImage) -> CheckOutcome {
    let v = imaging::laplacian_variance(gray);
    if v > 100.0 {
        (0.85, None)
    } else if v > 30.0 {
        (0.6, Some("weak_fingerprint"))
    } else {
        (0.2, Some("no_fingerprint_detected"))
    }
}

fn text_check(gray: &GrayImage) -> CheckOutcome {
    let black = imaging::black_ratio(&imaging::otsu_binarize(gray, false));
    if black > 0.05 && black < 0.5 {
        (0.8, None)
    } else if black > 0.02 && black < 0.7 {
        (0.5, Some("unusual_text_density"))
    } else {
        (0.2, Some("no_text_detected"))
    }
}

fn barcode_check(gray: &GrayImage) -> CheckOutcome {
    let binary = imaging::threshold(gray, 127, false);
    let black = imaging::black_ratio(&binary);
    if !(black > 0.3 && black < 0.7) {
        return (0.3, Some("no_barcode_detected"));
    }
    let (w, h) = binary.dimensions();
    let column_means =
        (0..w).map(|x| (0..h).map(|y| binary.get_pixel(x, y)[0] as f64).sum::<f64>() / h as f64);
    if imaging::variance(column_means) > 5000.0 {
        (0.9, None)
    } else {
        (0.6, Some("weak_barcode_pattern"))
    }
}

fn is_green(hsv: &[u8]) -> bool {
    (35..=85).contains(&hsv[0]) && hsv[1] >= 30 && hsv[2] >= 30
}

fn is_pink(hsv: &[u8]) -> bool {
    hsv[0] >= 140 && hsv[1] >= 20 && hsv[2] >= 100
}

fn shape_check(crop: &RgbImage, zone: &str) -> CheckOutcome {
    let name = zone.to_lowercase();
    if !(name.contains("argentina") || name.contains("map")) {
        return (0.7, None);
    }
    let hsv = imaging::to_hsv(crop);
    let green = imaging::ratio(hsv.pixels(), |p| is_green(&p.0));
    let dark = imaging::ratio(crop.pixels(), |p| p.0.iter().all(|&c| c <= 80));
    let shape = green.max(dark);
    if shape > 0.15 {
        (0.85, None)
    } else if shape > 0.05 {
        (0.5, Some("weak_map_shape"))
    } else {
        (0.2, Some("no_map_detected"))
    }
}

fn expected_color_check(crop: &RgbImage, zone: &str) -> CheckOutcome {
    let name = zone.to_lowercase();
    let hsv = imaging::to_hsv(crop);
    let ratio = if name.contains("green") {
        imaging::ratio(hsv.pixels(), |p| is_green(&p.0))
    } else if name.contains("pink") || name.contains("decorative") {
        imaging::ratio(hsv.pixels(), |p| is_pink(&p.0))
    } else {
        return (0.7, None);
    };
    if ratio > 0.1 {
        (0.85, None)
    } else {
        (0.4, Some("expected_color_not_found"))
    }
}

fn pattern_check(crop: &RgbImage) -> CheckOutcome {
    let hsv = imaging::to_hsv(crop);
    if imaging::variance(hsv.as_raw().iter().map(|&v| v as f64)) > 500.0 {
        (0.8, None)
    } else {
        (0.4, Some("weak_pattern"))
    }
}

fn basic_zone_check(crop: &RgbImage) -> (f64, Vec<String>) {
    let (mean, std) = imaging::mean_std(crop.as_raw().iter().map(|&v| v as f64));
    if mean > 20.0 && mean < 240.0 && std * std > 100.0 {
        (0.7, Vec::new())
    } else {
        (0.4, vec!["unusual_zone_content".to_string()])
    }
}

// ── Layout detection ────────────────────────────────────────────────

/// Best-guess layout for an image when the caller does not know it.
pub fn detect_template(image: &RgbImage, side: Side) -> &'static str {
    let (w, h) = image.dimensions();
    if w < MIN_ZONE_PX || h < MIN_ZONE_PX {
        return DEFAULT_TEMPLATE;
    }
    if has_pink_ink(image) {
        return "nuevo_2023";
    }
    match side {
        Side::Front => {
            if looks_like_old_front(image) {
                "antiguo"
            } else if has_hologram_face(&imaging::crop_rgb(image, Roi::new(0.3, 0.4, 0.3, 0.3))) {
                "nuevo_2016"
            } else {
                DEFAULT_TEMPLATE
            }
        }
        Side::Back => {
            let bottom = imaging::crop_gray(&imaging::to_gray(image), Roi::new(0.0, 0.72, 1.0, 0.28));
            if !has_mrz_rows(&bottom) {
                return "antiguo";
            }
            let hologram = imaging::to_hsv(&imaging::crop_rgb(image, Roi::new(0.32, 0.25, 0.26, 0.30)));
            let blue = imaging::ratio(hologram.pixels(), |p| {
                (90..=130).contains(&p[0]) && p[1] >= 50 && p[2] >= 50
            });
            let hue_var = imaging::variance(hsv_channel(&hologram, 0));
            if hue_var > 600.0 && blue > 0.15 {
                "nuevo_2016"
            } else {
                DEFAULT_TEMPLATE
            }
        }
    }
}

fn has_pink_ink(image: &RgbImage) -> bool {
    imaging::ratio(image.pixels(), |p| is_pink(&imaging::rgb_to_hsv(p))) > 0.02
}

/// Old cards carry the photo on the right, or a banded bottom strip.
fn looks_like_old_front(image: &RgbImage) -> bool {
    let skin = |roi: Roi| {
        let hsv = imaging::to_hsv(&imaging::crop_rgb(image, roi));
        let loose = imaging::ratio(hsv.pixels(), |p| p[0] <= 20 && p[1] >= 20 && p[2] >= 70);
        let pale = imaging::ratio(hsv.pixels(), |p| {
            p[0] <= 25 && (10..=150).contains(&p[1]) && p[2] >= 100
        });
        (loose + pale) / 2.0
    };
    let right = skin(Roi::new(0.52, 0.05, 0.46, 0.60));
    let left = skin(Roi::new(0.0, 0.05, 0.30, 0.50));
    if right > 0.08 && right > left * 1.2 {
        return true;
    }

    let bottom = imaging::crop_gray(&imaging::to_gray(image), Roi::new(0.0, 0.72, 1.0, 0.28));
    let binary = imaging::otsu_binarize(&bottom, false);
    let (bw, bh) = binary.dimensions();
    if bw == 0 || bh < 2 {
        return false;
    }
    let profile: Vec<f64> = (0..bh)
        .map(|y| (0..bw).map(|x| binary.get_pixel(x, y)[0] as f64).sum::<f64>() / bw as f64)
        .collect();
    profile.windows(2).filter(|p| (p[1] - p[0]).abs() > 40.0).count() >= 4
}

/// Ring-shaped edge blobs the size of the sun hologram's face.
fn has_hologram_face(region: &RgbImage) -> bool {
    let edges = imaging::edges(&imaging::to_gray(region), 50.0, 150.0);
    imaging::components(&edges).iter().any(|c| {
        let (cw, ch) = (c.width() as f64, c.height() as f64);
        let diameter = (cw + ch) / 2.0;
        (20.0..=100.0).contains(&diameter)
            && (0.8..=1.25).contains(&(cw / ch))
            && c.area as f64 >= 0.6 * std::f64::consts::PI * diameter
    })
}

/// At least two of three horizontal thirds carry text-like ink.
fn has_mrz_rows(gray: &GrayImage) -> bool {
    let (w, h) = gray.dimensions();
    if w == 0 || h < 3 {
        return false;
    }
    let binary = imaging::otsu_binarize(gray, false);
    let dark = imaging::black_ratio(&binary);
    if !(0.08..=0.60).contains(&dark) {
        return false;
    }
    let row_h = h / 3;
    (0..3)
        .filter(|i| {
            let band = imageops::crop_imm(&binary, 0, i * row_h, w, row_h).to_image();
            imaging::black_ratio(&band) > 0.10
        })
        .count()
        >= 2
}
