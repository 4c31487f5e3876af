//! Multi-frame liveness: a real card moved under light changes its
//! highlights and hologram hues between frames, a printout or screen does not.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops, imageops::FilterType, GrayImage, RgbImage};
use tracing::{debug, warn};

use crate::models::analysis::{Analysis, LivenessReport};
use crate::services::imaging;

pub const MIN_FRAMES: usize = 3;
pub const MAX_FRAMES: usize = 10;

const REFLECTION_CHANGE_MIN: f64 = 0.05;
const REFLECTION_PARTIAL: f64 = 0.02;
const HOLOGRAM_CHANGE_MIN: f64 = 0.03;
const HOLOGRAM_PARTIAL: f64 = 0.01;
const MOTION_MIN: f64 = 0.01;
const STATIC_EPSILON: f64 = 0.001;
const LIVE_SCORE: f64 = 0.6;

#[derive(Debug, Clone, Default)]
pub struct LivenessAnalyzer;

impl LivenessAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze base64 frames (optionally data-URL prefixed). Frames past the tenth are ignored.
    pub fn analyze(&self, frames: &[String]) -> Analysis<LivenessReport> {
        if frames.len() < MIN_FRAMES {
            return Analysis::unavailable(format!(
                "insufficient_frames: need {MIN_FRAMES}, got {}",
                frames.len()
            ));
        }
        let decoded: Vec<RgbImage> = frames
            .iter()
            .take(MAX_FRAMES)
            .enumerate()
            .filter_map(|(i, frame)| match decode_frame(frame) {
                Ok(img) => Some(img),
                Err(reason) => {
                    warn!(frame = i, reason = %reason, "failed to decode liveness frame");
                    None
                }
            })
            .collect();
        if decoded.len() < MIN_FRAMES {
            return Analysis::unavailable("frame_decode_failed");
        }
        Analysis::Available(analyze_frames(&decoded))
    }
}

fn decode_frame(frame: &str) -> Result<RgbImage, String> {
    let payload = match frame.split_once(',') {
        Some((_, data)) => data,
        None => frame,
    };
    let bytes = STANDARD.decode(payload.trim()).map_err(|e| e.to_string())?;
    let img = image::load_from_memory(&bytes).map_err(|e| e.to_string())?;
    Ok(img.to_rgb8())
}

pub fn analyze_frames(frames: &[RgbImage]) -> LivenessReport {
    let grays: Vec<GrayImage> = frames.iter().map(imaging::to_gray).collect();

    let highlights: Vec<f64> = grays
        .iter()
        .map(|g| imaging::ratio(g.pixels(), |p| p[0] > 220))
        .collect();
    let reflection_variance = imaging::variance(highlights.iter().copied());
    let reflection_changed = reflection_variance > REFLECTION_CHANGE_MIN;

    let hue_variances: Vec<f64> = frames.iter().map(hologram_hue_variance).collect();
    let hologram_change = mean_abs_step(&hue_variances);
    let hologram_changed = hologram_change > HOLOGRAM_CHANGE_MIN;

    let motion = mean_motion(&grays);
    let motion_detected = motion > MOTION_MIN;

    let mut score: f64 = 0.0;
    if reflection_changed {
        score += 0.35;
    } else if reflection_variance > REFLECTION_PARTIAL {
        score += 0.15;
    }
    if hologram_changed {
        score += 0.35;
    } else if hologram_change > HOLOGRAM_PARTIAL {
        score += 0.15;
    }
    if motion_detected {
        score += (motion * 10.0).min(0.3);
    }
    let score: f64 = score.min(1.0);

    let mut flags = Vec::new();
    if !reflection_changed {
        flags.push("no_reflection_change".to_string());
    }
    if !hologram_changed {
        flags.push("no_hologram_change".to_string());
    }
    if !motion_detected {
        flags.push("no_document_motion".to_string());
    }
    if reflection_variance < STATIC_EPSILON && hologram_change < STATIC_EPSILON {
        flags.push("possible_static_image".to_string());
    }

    debug!(score, frames = frames.len(), motion, "liveness analysed");
    LivenessReport {
        score: (score * 100.0).round() / 100.0,
        is_live: score >= LIVE_SCORE,
        frames_analyzed: frames.len(),
        reflection_variance,
        reflection_changed,
        hologram_change,
        hologram_changed,
        motion,
        motion_detected,
        flags,
    }
}

/// Hue variance over saturated, bright pixels; 0 when there are none.
fn hologram_hue_variance(frame: &RgbImage) -> f64 {
    let hues: Vec<f64> = frame
        .pixels()
        .map(imaging::rgb_to_hsv)
        .filter(|[_, s, v]| *s > 100 && *v > 150)
        .map(|[h, _, _]| h as f64)
        .collect();
    imaging::variance(hues.into_iter())
}

fn mean_abs_step(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let (mean, _) = imaging::mean_std(values.windows(2).map(|p| (p[1] - p[0]).abs()));
    mean
}

/// Mean absolute gray difference between consecutive frames, scaled to `[0, 1]`.
fn mean_motion(grays: &[GrayImage]) -> f64 {
    let steps = grays.windows(2).map(|pair| {
        let (prev, curr) = (&pair[0], &pair[1]);
        let resized;
        let curr = if curr.dimensions() != prev.dimensions() {
            resized = imageops::resize(curr, prev.width(), prev.height(), FilterType::Triangle);
            &resized
        } else {
            curr
        };
        let (mean, _) = imaging::mean_std(
            prev.pixels()
                .zip(curr.pixels())
                .map(|(a, b)| a[0].abs_diff(b[0]) as f64),
        );
        mean / 255.0
    });
    let (mean, _) = imaging::mean_std(steps);
    mean
}
