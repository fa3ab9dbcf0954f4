//! Canonical stage output schema
//!
//! Every stage stores its output in the metadata of its `.completed` event, so
//! a later stage running in a fresh process can rebuild its inputs from the
//! event log alone. All structs serialize snake_case; deserialization also
//! accepts the camelCase spellings model providers tend to emit.

use crate::providers::ProviderErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Category name → score on a 0-100 scale
pub type CategoryScores = BTreeMap<String, f64>;

/// How the context profile was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    #[default]
    Detector,
    Provider,
}

/// Output of the context stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextProfile {
    #[serde(alias = "primaryType", alias = "screen_type", alias = "screenType")]
    pub primary_type: String,
    /// 0.0-1.0
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, alias = "targetAudience", alias = "target_audience")]
    pub audience: Option<String>,
    #[serde(default, alias = "businessGoals")]
    pub goals: Vec<String>,
    #[serde(default)]
    pub source: ContextSource,
}

/// One provider invocation result, recorded in stage event metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub operation_key: String,
    /// Subject the call was about (group fan-out)
    pub subject_id: Option<String>,
    pub succeeded: bool,
    pub latency_ms: u64,
    pub attempts: u32,
    pub error_kind: Option<ProviderErrorKind>,
    pub error: Option<String>,
}

/// What a vision provider reported about one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VisionObservation {
    #[serde(default, alias = "subjectId")]
    pub subject_id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default, alias = "uiElements", alias = "ui_elements", alias = "labels")]
    pub elements: Vec<String>,
    #[serde(default, alias = "detectedText", alias = "text")]
    pub detected_text: Vec<String>,
    #[serde(default, alias = "layoutNotes", alias = "observations")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Output of the vision stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VisionStageOutput {
    pub outcomes: Vec<ProviderOutcome>,
    pub observations: Vec<VisionObservation>,
}

impl VisionStageOutput {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }
}

/// Severity of an annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    #[default]
    #[serde(alias = "moderate")]
    Medium,
    Low,
    #[serde(alias = "information")]
    Info,
}

/// Normalized image region (0.0-1.0 coordinates)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A located finding on an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, alias = "subjectId", alias = "imageId")]
    pub subject_id: Option<String>,
    pub title: String,
    #[serde(default, alias = "feedback", alias = "details")]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, alias = "type")]
    pub category: Option<String>,
    #[serde(default, alias = "boundingBox", alias = "bounding_box")]
    pub region: Option<Region>,
}

/// An actionable improvement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    #[serde(default, alias = "details")]
    pub description: String,
    #[serde(default)]
    pub priority: Severity,
    #[serde(default, alias = "type")]
    pub category: Option<String>,
}

/// Per-image assessment reported by the ai stage of a group job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageAssessment {
    #[serde(alias = "subjectId", alias = "imageId")]
    pub subject_id: String,
    #[serde(default, alias = "categoryScores", alias = "scores")]
    pub category_scores: CategoryScores,
    #[serde(default, alias = "uiElements")]
    pub elements: Vec<String>,
    #[serde(default, alias = "designInconsistencies")]
    pub inconsistencies: Vec<String>,
    #[serde(default, alias = "userJourneyGaps", alias = "journeyGaps")]
    pub journey_gaps: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
}

/// Cross-image assessment reported by the ai stage of a group job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CrossImageAssessment {
    #[serde(default, alias = "thematicCoherence")]
    pub thematic_coherence: Option<f64>,
    #[serde(default, alias = "userFlowContinuity")]
    pub user_flow_continuity: Option<f64>,
    #[serde(default, alias = "commonElements")]
    pub common_elements: Vec<String>,
    #[serde(default, alias = "designInconsistencies")]
    pub design_inconsistencies: Vec<String>,
    #[serde(default, alias = "userJourneyGaps")]
    pub user_journey_gaps: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Output of the ai stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AiAnalysis {
    #[serde(default, alias = "overallSummary", alias = "overall_summary")]
    pub summary: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default, alias = "recommendations")]
    pub suggestions: Vec<Suggestion>,
    #[serde(default, alias = "categoryScores", alias = "scores")]
    pub category_scores: CategoryScores,
    /// 0.0-1.0 self-reported confidence
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, alias = "perImage", alias = "images")]
    pub per_image: Vec<ImageAssessment>,
    #[serde(default, alias = "crossImage", alias = "crossImageAnalysis")]
    pub cross_image: Option<CrossImageAssessment>,
}

/// Ai stage event metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiStageOutput {
    pub analysis: AiAnalysis,
    pub outcome: ProviderOutcome,
}

/// Context stage event metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextStageOutput {
    pub profile: ContextProfile,
    /// Present when a context provider was consulted
    pub outcome: Option<ProviderOutcome>,
}

/// Mean of category scores, `None` when there are none
pub fn mean_score(scores: &CategoryScores) -> Option<f64> {
    if scores.is_empty() {
        None
    } else {
        Some(scores.values().sum::<f64>() / scores.len() as f64)
    }
}
