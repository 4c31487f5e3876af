use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::models::analysis::{Analysis, AuthenticityReport, LivenessReport};

/// Extracted fields keyed by canonical field name.
///
/// Ordered so that serialized results are byte-identical across runs.
pub type FieldMap = BTreeMap<String, String>;

/// Independent recognizer that contributed fields.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Source {
    Pdf417,
    Mrz,
    Ocr,
}

/// Physical layout picked by the variant classifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Variant {
    DniNewFront,
    DniNewBack,
    DniOld,
    Unknown,
}

/// Card side, used by the template verifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Side {
    Front,
    Back,
}

impl Variant {
    pub fn side(self) -> Side {
        match self {
            Variant::DniNewBack => Side::Back,
            _ => Side::Front,
        }
    }
}

/// Cross-check outcome of a multi-source read. Single-source readers leave it empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provenance {
    /// At least two sources agreed on the document number.
    pub verified: bool,
    /// At least two sources read different document numbers.
    pub discrepancy: bool,
    pub sources_used: Vec<Source>,
}

/// Output of one extraction strategy. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub source: String,
    pub fields: FieldMap,
    pub confidence: f64,
    #[serde(default)]
    pub provenance: Provenance,
}

impl ExtractionResult {
    pub fn new(source: impl Into<String>, fields: FieldMap, confidence: f64) -> Self {
        Self {
            source: source.into(),
            fields,
            confidence: confidence.clamp(0.0, 1.0),
            provenance: Provenance::default(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn empty(source: impl Into<String>) -> Self {
        Self::new(source, FieldMap::new(), 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Merged multi-source result with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub fields: FieldMap,
    pub verified: bool,
    pub discrepancy: bool,
    pub sources_used: Vec<Source>,
    /// Source-priority string reported for observability, e.g. `mrz+ocr`.
    pub source: String,
    pub confidence: f64,
}

impl From<FusedResult> for ExtractionResult {
    fn from(fused: FusedResult) -> Self {
        let provenance = Provenance {
            verified: fused.verified,
            discrepancy: fused.discrepancy,
            sources_used: fused.sources_used,
        };
        ExtractionResult::new(fused.source, fused.fields, fused.confidence).with_provenance(provenance)
    }
}

/// Final output of the document processor for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub variant: Option<Variant>,
    pub classifier_confidence: Option<f64>,
    pub source: String,
    pub fields: FieldMap,
    pub confidence: f64,
    pub provenance: Provenance,
    pub processing_time_ms: u64,
    /// Non-fatal problems seen along the way (degraded sources, skipped transforms).
    pub warnings: Vec<String>,
}

/// Result metadata persisted beside the field map, so a redelivered message
/// can republish the same `document.extracted.v1` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionDetails {
    pub source: String,
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticity_result: Option<Analysis<AuthenticityReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_result: Option<Analysis<LivenessReport>>,
}
