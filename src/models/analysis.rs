use serde::{Deserialize, Serialize};

use crate::models::extraction::Side;

/// Result of an optional sub-analyzer. Degraded analyzers never fail extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Analysis<T> {
    Available(T),
    Unavailable { reason: String, flags: Vec<String> },
}

impl<T> Analysis<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Analysis::Unavailable {
            reason: reason.into(),
            flags: vec!["analysis_unavailable".to_string()],
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Analysis::Available(_))
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            Analysis::Available(report) => Some(report),
            Analysis::Unavailable { .. } => None,
        }
    }
}

// ── Authenticity ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticityMetrics {
    pub saturation_mean: f64,
    pub low_saturation_ratio: f64,
    pub sharpness_variance: f64,
    pub glare_ratio: f64,
    pub has_glare: bool,
    pub moire_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticityReport {
    pub score: f64,
    pub is_likely_authentic: bool,
    pub flags: Vec<String>,
    pub metrics: AuthenticityMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<Analysis<TemplateReport>>,
}

// ── Template zones ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneResult {
    pub zone: String,
    pub score: f64,
    pub verified: bool,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateReport {
    pub template: String,
    pub side: Side,
    pub score: f64,
    pub critical_zones_passed: bool,
    pub zones: Vec<ZoneResult>,
    pub flags: Vec<String>,
}

// ── Liveness ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub score: f64,
    pub is_live: bool,
    pub frames_analyzed: usize,
    pub reflection_variance: f64,
    pub reflection_changed: bool,
    pub hologram_change: f64,
    pub hologram_changed: bool,
    pub motion: f64,
    pub motion_detected: bool,
    pub flags: Vec<String>,
}
