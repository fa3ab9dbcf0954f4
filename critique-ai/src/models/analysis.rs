//! Versioned analysis results

use super::stage_output::{Annotation, Suggestion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a persisted analysis row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(ResultStatus::Completed),
            "failed" => Ok(ResultStatus::Failed),
            other => Err(format!("unknown result status '{}'", other)),
        }
    }
}

/// Stored analysis body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisPayload {
    pub annotations: Vec<Annotation>,
    pub suggestions: Vec<Suggestion>,
    pub summary: String,
    pub metadata: serde_json::Value,
}

/// One version of an analysis for (subject_id, analysis_type)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub subject_id: String,
    pub analysis_type: String,
    /// Dedup key: sha256(subject_id, analysis_type, user_context)
    pub analysis_hash: String,
    /// Starts at 1, contiguous per (subject_id, analysis_type)
    pub version: i64,
    pub status: ResultStatus,
    pub payload: AnalysisPayload,
    pub overall_quality: u8,
    pub is_partial_result: bool,
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Input to `VersionManager::store`
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub subject_id: String,
    pub analysis_type: String,
    pub user_context: Option<String>,
    pub payload: AnalysisPayload,
    pub overall_quality: u8,
    pub is_partial_result: bool,
    pub job_id: Option<Uuid>,
    /// Skip the dedup window and always create a new version
    pub force_new: bool,
    /// Override the configured dedup window
    pub within_hours: Option<u32>,
}

/// Result of `VersionManager::store`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub id: Uuid,
    pub version: i64,
    /// False when an existing row was returned (dedup hit or lost race)
    pub is_new: bool,
    /// Quality of the returned row, which is not this request's on reuse
    pub overall_quality: u8,
    pub is_partial_result: bool,
}

impl StoreOutcome {
    /// Outcome pointing at an already stored row
    pub fn existing(result: &AnalysisResult) -> Self {
        Self {
            id: result.id,
            version: result.version,
            is_new: false,
            overall_quality: result.overall_quality,
            is_partial_result: result.is_partial_result,
        }
    }
}

/// Result of `VersionManager::check_existing`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingInfo {
    pub id: Uuid,
    pub version: i64,
    pub analysis_hash: String,
    pub created_at: DateTime<Utc>,
}

impl From<&AnalysisResult> for ExistingInfo {
    fn from(result: &AnalysisResult) -> Self {
        Self {
            id: result.id,
            version: result.version,
            analysis_hash: result.analysis_hash.clone(),
            created_at: result.created_at,
        }
    }
}
