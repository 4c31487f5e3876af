use image::{imageops, imageops::FilterType, GrayImage, Luma, RgbImage};
use tracing::{debug, warn};

use crate::services::imaging;

const TARGET_WIDTH: u32 = 1200;
const CLAHE_CLIP_LIMIT: f64 = 2.0;
const CLAHE_TILES: u32 = 8;
const MIN_SKEW_DEGREES: f64 = 0.5;
const MAX_SKEW_DEGREES: f64 = 10.0;
const SKEW_STEP_DEGREES: f64 = 0.25;

/// One best-effort normalization step.
///
/// `Ok(None)` means the step decided not to touch the image.
type TransformFn = fn(&RgbImage) -> Result<Option<RgbImage>, String>;

/// Ordered list of fallible transforms. A failing step is logged and the
/// previous image passes through unchanged.
pub struct Normalizer {
    steps: Vec<(&'static str, TransformFn)>,
}

/// Normalized image plus the reasons any step fell through.
pub struct Normalized {
    pub image: RgbImage,
    pub applied: Vec<&'static str>,
    pub warnings: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            steps: vec![
                ("deskew", deskew),
                ("trim_margins", trim_margins),
                ("crop_document", crop_document),
                ("resize", resize_to_standard),
                ("clahe", equalize),
            ],
        }
    }
}

impl Normalizer {
    pub fn run(&self, image: RgbImage) -> Normalized {
        let mut current = image;
        let mut applied = Vec::new();
        let mut warnings = Vec::new();
        for (name, step) in &self.steps {
            match step(&current) {
                Ok(Some(next)) if next.width() > 0 && next.height() > 0 => {
                    debug!(step = name, width = next.width(), height = next.height(), "normalization step applied");
                    current = next;
                    applied.push(*name);
                }
                Ok(_) => {}
                Err(reason) => {
                    warn!(step = name, reason = %reason, "normalization step failed, continuing");
                    warnings.push(format!("{name}: {reason}"));
                }
            }
        }
        Normalized {
            image: current,
            applied,
            warnings,
        }
    }
}

// ── Steps ───────────────────────────────────────────────────────────

/// Projection-profile skew estimate, rotated back when it exceeds half a degree.
fn deskew(image: &RgbImage) -> Result<Option<RgbImage>, String> {
    let gray = imaging::to_gray(image);
    match estimate_skew(&gray) {
        Some(angle) if angle.abs() >= MIN_SKEW_DEGREES => {
            Ok(Some(imaging::rotate_bilinear(image, angle)))
        }
        _ => Ok(None),
    }
}

/// Angle (degrees) that makes dark rows crispest, or `None` for too little ink.
pub fn estimate_skew(gray: &GrayImage) -> Option<f64> {
    let (w, h) = gray.dimensions();
    if w < 50 || h < 50 {
        return None;
    }
    let ink = imaging::ratio(gray.pixels(), |p| p[0] < 128);
    if ink < 0.02 {
        return None;
    }

    // Work on a downscaled copy; the estimate only needs row structure.
    let scale = (400.0 / w as f64).min(1.0);
    let small = if scale < 1.0 {
        imageops::resize(
            gray,
            (w as f64 * scale) as u32,
            ((h as f64 * scale) as u32).max(1),
            FilterType::Triangle,
        )
    } else {
        gray.clone()
    };

    let steps = (MAX_SKEW_DEGREES / SKEW_STEP_DEGREES).round() as i32;
    let mut best_angle: f64 = 0.0;
    let mut best_score = f64::NEG_INFINITY;
    for step in -steps..=steps {
        let angle = step as f64 * SKEW_STEP_DEGREES;
        let score = projection_score(&small, angle);
        // Equal scores prefer the smaller correction.
        if score > best_score || (score == best_score && angle.abs() < best_angle.abs()) {
            best_score = score;
            best_angle = angle;
        }
    }
    Some(best_angle)
}

fn projection_score(gray: &GrayImage, angle: f64) -> f64 {
    let (w, h) = gray.dimensions();
    let tan = angle.to_radians().tan();
    let mut rows = vec![0u32; h as usize];
    for (row, slot) in rows.iter_mut().enumerate() {
        let mut x = 0;
        while x < w {
            let sy = (row as f64 + x as f64 * tan).round();
            if sy >= 0.0 && (sy as u32) < h && gray.get_pixel(x, sy as u32)[0] < 128 {
                *slot += 1;
            }
            x += 2;
        }
    }
    rows.windows(2)
        .map(|p| (p[1] as f64 - p[0] as f64).powi(2))
        .sum()
}

/// Crop away near-white scanner margins, keeping 10px padding.
fn trim_margins(image: &RgbImage) -> Result<Option<RgbImage>, String> {
    let gray = imaging::to_gray(image);
    let content = imaging::threshold(&gray, 250, true);
    let Some((x0, y0, x1, y1)) = bounds_of_nonzero(&content) else {
        return Ok(None);
    };
    let (w, h) = image.dimensions();
    let (x, y, cw, ch) = pad_rect(x0, y0, x1, y1, 10, w, h);
    if cw < 100 || ch < 100 || (cw, ch) == (w, h) {
        return Ok(None);
    }
    Ok(Some(imageops::crop_imm(image, x, y, cw, ch).to_image()))
}

/// Crop to the card outline when it sits on a bright background.
fn crop_document(image: &RgbImage) -> Result<Option<RgbImage>, String> {
    let gray = imaging::to_gray(image);
    let white = imaging::ratio(gray.pixels(), |p| p[0] > 240);
    if white < 0.15 {
        return Ok(None);
    }
    let blurred: GrayImage = imageops::blur(&gray, 1.1);
    let outline = imaging::dilate(&imaging::edges(&blurred, 30.0, 100.0), 5, 5, 2);
    let Some(largest) = imaging::components(&outline)
        .into_iter()
        .max_by_key(|c| c.bbox_area())
    else {
        return Ok(None);
    };

    let (w, h) = image.dimensions();
    if (largest.bbox_area() as f64) < 0.3 * (w as f64 * h as f64) {
        return Ok(None);
    }
    let aspect = largest.width() as f64 / largest.height() as f64;
    if !(1.2..=2.0).contains(&aspect) {
        return Ok(None);
    }
    let (x, y, cw, ch) = pad_rect(largest.min_x, largest.min_y, largest.max_x, largest.max_y, 5, w, h);
    if (cw, ch) == (w, h) {
        return Ok(None);
    }
    Ok(Some(imageops::crop_imm(image, x, y, cw, ch).to_image()))
}

fn resize_to_standard(image: &RgbImage) -> Result<Option<RgbImage>, String> {
    let (w, h) = image.dimensions();
    if w == 0 {
        return Err("zero-width image".to_string());
    }
    if w == TARGET_WIDTH {
        return Ok(None);
    }
    let new_h = ((h as f64 * TARGET_WIDTH as f64 / w as f64) as u32).max(1);
    Ok(Some(imageops::resize(image, TARGET_WIDTH, new_h, FilterType::CatmullRom)))
}

/// CLAHE on luminance; chroma is preserved by rescaling each channel.
fn equalize(image: &RgbImage) -> Result<Option<RgbImage>, String> {
    let gray = imaging::to_gray(image);
    let eq = imaging::clahe(&gray, CLAHE_CLIP_LIMIT, CLAHE_TILES, CLAHE_TILES);
    let mut out = image.clone();
    for (x, y, p) in out.enumerate_pixels_mut() {
        let before = gray.get_pixel(x, y)[0] as f64;
        let Luma([after]) = *eq.get_pixel(x, y);
        if before == 0.0 {
            p.0 = [after; 3];
            continue;
        }
        let gain = after as f64 / before;
        for c in p.0.iter_mut() {
            *c = (*c as f64 * gain).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(Some(out))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn bounds_of_nonzero(binary: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in binary.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds
}

fn pad_rect(x0: u32, y0: u32, x1: u32, y1: u32, pad: u32, w: u32, h: u32) -> (u32, u32, u32, u32) {
    let x = x0.saturating_sub(pad);
    let y = y0.saturating_sub(pad);
    let cw = (x1 - x0 + 1 + 2 * pad).min(w - x);
    let ch = (y1 - y0 + 1 + 2 * pad).min(h - y);
    (x, y, cw, ch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn card_on_white() -> RgbImage {
        RgbImage::from_fn(600, 400, |x, y| {
            if (100..500).contains(&x) && (100..350).contains(&y) {
                Rgb([60 + (x % 40) as u8, 90, 140])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    #[test]
    fn test_pipeline_resizes_to_standard_width() {
        let out = Normalizer::default().run(card_on_white());
        assert_eq!(out.image.width(), TARGET_WIDTH);
        assert!(out.applied.contains(&"resize"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_trim_margins_removes_white_border() {
        let trimmed = trim_margins(&card_on_white()).unwrap().unwrap();
        assert_eq!(trimmed.dimensions(), (420, 270));
    }

    #[test]
    fn test_trim_skips_tiny_content() {
        let img = RgbImage::from_fn(300, 300, |x, y| {
            if x < 20 && y < 20 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        assert!(trim_margins(&img).unwrap().is_none());
    }

    #[test]
    fn test_failed_step_passes_previous_image() {
        fn broken(_: &RgbImage) -> Result<Option<RgbImage>, String> {
            Err("boom".to_string())
        }
        let normalizer = Normalizer {
            steps: vec![("broken", broken)],
        };
        let input = card_on_white();
        let out = normalizer.run(input.clone());
        assert_eq!(out.image, input);
        assert_eq!(out.warnings, vec!["broken: boom".to_string()]);
    }

    #[test]
    fn test_straight_text_has_no_skew() {
        let gray = GrayImage::from_fn(200, 200, |_, y| Luma([if y % 20 < 4 { 0 } else { 255 }]));
        assert_eq!(estimate_skew(&gray), Some(0.0));
    }
}
