//! Photocopy, screen-recapture and moiré heuristics.
//!
//! The basic analysis looks at global color and frequency statistics. The
//! combined analysis blends it with the template zone verifier.

use rustfft::{num_complex::Complex, FftPlanner};
use image::{GrayImage, RgbImage};
use tracing::debug;

use crate::models::analysis::{Analysis, AuthenticityMetrics, AuthenticityReport, TemplateReport};
use crate::models::extraction::Side;
use crate::services::imaging;
use crate::services::template::TemplateVerifier;

const SATURATION_MIN: f64 = 0.15;
const SATURATION_MAX: f64 = 0.85;
const LAPLACIAN_MIN: f64 = 50.0;
const GLARE_MAX_RATIO: f64 = 0.15;
const GLARE_PRESENT_RATIO: f64 = 0.02;
const MOIRE_THRESHOLD: f64 = 0.3;
const PHOTOCOPY_LOW_SATURATION_RATIO: f64 = 0.5;

const BASIC_WEIGHT: f64 = 0.4;
const TEMPLATE_WEIGHT: f64 = 0.6;
const COMBINED_PASS_SCORE: f64 = 0.6;
const COMBINED_MAX_FLAGS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct AuthenticityAnalyzer {
    template: TemplateVerifier,
}

impl AuthenticityAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and run the combined analysis; an undecodable image is reported, not raised.
    pub fn analyze_bytes(&self, bytes: &[u8], side: Side, template: Option<&str>) -> Analysis<AuthenticityReport> {
        match image::load_from_memory(bytes) {
            Ok(img) => Analysis::Available(self.analyze_combined(&img.to_rgb8(), side, template)),
            Err(e) => Analysis::unavailable(format!("image_decode_failed: {e}")),
        }
    }

    /// Decode and run the global checks only, for documents without a known layout.
    pub fn analyze_bytes_basic(&self, bytes: &[u8]) -> Analysis<AuthenticityReport> {
        match image::load_from_memory(bytes) {
            Ok(img) => Analysis::Available(self.analyze(&img.to_rgb8())),
            Err(e) => Analysis::unavailable(format!("image_decode_failed: {e}")),
        }
    }

    /// Global metrics only. `is_likely_authentic` means no flag was raised.
    pub fn analyze(&self, image: &RgbImage) -> AuthenticityReport {
        let metrics = measure(image);
        let flags = basic_flags(&metrics);
        let score = basic_score(&metrics);
        debug!(score, flags = flags.len(), "basic authenticity analysed");
        AuthenticityReport {
            score: round_to(score, 2),
            is_likely_authentic: flags.is_empty(),
            flags,
            metrics,
            template: None,
        }
    }

    /// Basic metrics blended with template zone verification when a layout applies.
    pub fn analyze_combined(&self, image: &RgbImage, side: Side, template: Option<&str>) -> AuthenticityReport {
        let basic = self.analyze(image);
        let zones = self.template.verify(image, side, template);
        combine(basic, zones)
    }
}

fn combine(basic: AuthenticityReport, zones: Analysis<TemplateReport>) -> AuthenticityReport {
    let Some(report) = zones.available() else {
        return AuthenticityReport {
            template: Some(zones),
            ..basic
        };
    };

    let combined = basic.score * BASIC_WEIGHT + report.score * TEMPLATE_WEIGHT;
    let mut flags = basic.flags.clone();
    for flag in &report.flags {
        if !flags.contains(flag) {
            flags.push(flag.clone());
        }
    }
    AuthenticityReport {
        score: round_to(combined, 2),
        is_likely_authentic: combined >= COMBINED_PASS_SCORE && flags.len() <= COMBINED_MAX_FLAGS,
        flags,
        metrics: basic.metrics,
        template: Some(zones),
    }
}

// ── Metrics ─────────────────────────────────────────────────────────

fn measure(image: &RgbImage) -> AuthenticityMetrics {
    let hsv = imaging::to_hsv(image);
    let (saturation_mean, _) = imaging::mean_std(hsv.pixels().map(|p| p[1] as f64 / 255.0));
    let low_saturation_ratio = imaging::ratio(hsv.pixels(), |p| (p[1] as f64 / 255.0) < 0.1);
    let glare_ratio = imaging::ratio(hsv.pixels(), |p| p[1] < 30 && p[2] > 230);
    let gray = imaging::to_gray(image);

    AuthenticityMetrics {
        saturation_mean: round_to(saturation_mean, 3),
        low_saturation_ratio: round_to(low_saturation_ratio, 3),
        sharpness_variance: round_to(imaging::laplacian_variance(&gray), 2),
        glare_ratio: round_to(glare_ratio, 3),
        has_glare: glare_ratio > GLARE_PRESENT_RATIO,
        moire_ratio: round_to(moire_ratio(&gray), 3),
    }
}

fn basic_flags(m: &AuthenticityMetrics) -> Vec<String> {
    let mut flags = Vec::new();
    if m.saturation_mean < SATURATION_MIN {
        flags.push("low_saturation");
    }
    if m.sharpness_variance < LAPLACIAN_MIN {
        flags.push("low_sharpness");
    }
    if m.glare_ratio > GLARE_MAX_RATIO {
        flags.push("excessive_glare");
    }
    if m.moire_ratio > MOIRE_THRESHOLD {
        flags.push("moire_pattern_detected");
    }
    if m.low_saturation_ratio > PHOTOCOPY_LOW_SATURATION_RATIO {
        flags.push("possible_photocopy");
    }
    flags.into_iter().map(String::from).collect()
}

fn basic_score(m: &AuthenticityMetrics) -> f64 {
    let mut score = 1.0;
    if m.saturation_mean < SATURATION_MIN {
        score -= 0.25;
    } else if m.saturation_mean > SATURATION_MAX {
        score -= 0.10;
    }
    if m.sharpness_variance < LAPLACIAN_MIN {
        score -= ((LAPLACIAN_MIN - m.sharpness_variance) / 100.0).min(0.3);
    }
    if m.glare_ratio > GLARE_MAX_RATIO {
        score -= 0.15;
    } else if m.has_glare {
        score += 0.10;
    }
    if m.moire_ratio > MOIRE_THRESHOLD {
        score -= 0.30;
    }
    score.clamp(0.0, 1.0)
}

/// Share of spectral magnitude in the mid-frequency annulus `(r/8, r/3]`.
///
/// Screens photographed with a camera leave periodic interference there.
pub fn moire_ratio(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    if w < 8 || h < 8 {
        return 0.0;
    }
    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft_forward(w);
    let col_fft = planner.plan_fft_forward(h);

    let mut data: Vec<Complex<f64>> = gray.pixels().map(|p| Complex::new(p[0] as f64, 0.0)).collect();
    for row in data.chunks_exact_mut(w) {
        row_fft.process(row);
    }
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for x in 0..w {
        for y in 0..h {
            column[y] = data[y * w + x];
        }
        col_fft.process(&mut column);
        for y in 0..h {
            data[y * w + x] = column[y];
        }
    }

    let r = w.min(h);
    let (inner, outer) = ((r / 8) as f64, (r / 3) as f64);
    let mut mid = 0.0;
    let mut total = 0.0;
    for y in 0..h {
        // Centred frequency offsets, as after an fftshift.
        let fy = ((y + h / 2) % h) as f64 - (h / 2) as f64;
        for x in 0..w {
            let fx = ((x + w / 2) % w) as f64 - (w / 2) as f64;
            let magnitude = data[y * w + x].norm();
            total += magnitude;
            let dist = (fx * fx + fy * fy).sqrt();
            if dist <= outer && dist > inner {
                mid += magnitude;
            }
        }
    }
    if total > 0.0 {
        mid / total
    } else {
        0.0
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn colorful_textured(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = if (x / 2 + y / 3) % 2 == 0 { 40 } else { 200 };
            Rgb([v, (x * 7 % 200) as u8 + 30, 220 - (y % 150) as u8])
        })
    }

    #[test]
    fn test_flat_gray_looks_like_photocopy() {
        let img = RgbImage::from_pixel(200, 120, Rgb([128, 128, 128]));
        let report = AuthenticityAnalyzer::new().analyze(&img);
        assert!(report.flags.contains(&"low_saturation".to_string()));
        assert!(report.flags.contains(&"low_sharpness".to_string()));
        assert!(report.flags.contains(&"possible_photocopy".to_string()));
        assert!(!report.is_likely_authentic);
        assert_eq!(report.score, 0.45);
    }

    #[test]
    fn test_glare_is_penalized() {
        let img = RgbImage::from_pixel(100, 100, Rgb([250, 250, 250]));
        let report = AuthenticityAnalyzer::new().analyze(&img);
        assert!(report.metrics.has_glare);
        assert!(report.flags.contains(&"excessive_glare".to_string()));
    }

    #[test]
    fn test_constant_image_has_no_midband_energy() {
        let gray = GrayImage::from_pixel(64, 64, Luma([100]));
        assert_eq!(moire_ratio(&gray), 0.0);
    }

    #[test]
    fn test_midband_stripes_raise_moire() {
        // Period 4 along x puts the peak at 16 of 64 bins, inside (8, 21].
        let gray = GrayImage::from_fn(64, 64, |x, _| Luma([if x % 4 < 2 { 0 } else { 255 }]));
        assert!(moire_ratio(&gray) > MOIRE_THRESHOLD);
    }

    #[test]
    fn test_undecodable_bytes_are_unavailable() {
        let result = AuthenticityAnalyzer::new().analyze_bytes(b"not an image", Side::Front, None);
        assert!(!result.is_available());
        match result {
            Analysis::Unavailable { flags, .. } => assert_eq!(flags, vec!["analysis_unavailable".to_string()]),
            Analysis::Available(_) => unreachable!(),
        }
    }

    #[test]
    fn test_combined_blends_template_score() {
        let img = colorful_textured(400, 250);
        let analyzer = AuthenticityAnalyzer::new();
        let basic = analyzer.analyze(&img);
        let combined = analyzer.analyze_combined(&img, Side::Front, Some("nuevo_2019"));
        let template = combined.template.as_ref().and_then(|t| t.available()).unwrap();
        let expected = round_to(basic.score * 0.4 + template.score * 0.6, 2);
        assert!((combined.score - expected).abs() <= 0.011);
        assert_eq!(combined.is_likely_authentic, combined.score >= 0.6 && combined.flags.len() <= 3);
    }

    #[test]
    fn test_unknown_layout_keeps_basic_result() {
        let img = colorful_textured(200, 120);
        let analyzer = AuthenticityAnalyzer::new();
        let combined = analyzer.analyze_combined(&img, Side::Front, Some("missing"));
        assert_eq!(combined.score, analyzer.analyze(&img).score);
        assert!(matches!(combined.template, Some(Analysis::Unavailable { .. })));
    }
}
