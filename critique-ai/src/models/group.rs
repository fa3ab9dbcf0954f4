//! Group analysis sessions

use super::stage_output::CategoryScores;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Allocated (fork) but not yet filled by a group job
    Pending,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Aggregate scores, each 0-100
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupSummary {
    pub overall_score: f64,
    pub consistency: f64,
    pub thematic_coherence: f64,
    pub user_flow_continuity: f64,
}

/// Cross-image pattern sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupPatterns {
    pub common_elements: Vec<String>,
    pub design_inconsistencies: Vec<String>,
    pub user_journey_gaps: Vec<String>,
}

/// Group analysis session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAnalysisResult {
    pub id: Uuid,
    pub session_id: Uuid,
    pub group_id: String,
    pub group_job_id: Option<Uuid>,
    pub status: SessionStatus,
    pub prompt: Option<String>,
    pub group_context: Option<String>,
    pub summary: GroupSummary,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub patterns: GroupPatterns,
    pub overall_quality: u8,
    pub is_partial_result: bool,
    /// Fork lineage; the parent is never mutated by the child
    pub parent_session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One image's contribution to a group aggregate
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PerImageResult {
    pub subject_id: String,
    pub category_scores: CategoryScores,
    pub elements: Vec<String>,
    pub inconsistencies: Vec<String>,
    pub journey_gaps: Vec<String>,
    pub insights: Vec<String>,
}

/// Group-level inputs to the aggregator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupContext {
    pub group_id: String,
    pub group_job_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub parent_session_id: Option<Uuid>,
    pub prompt: Option<String>,
    pub group_context: Option<String>,
    pub thematic_coherence: Option<f64>,
    pub user_flow_continuity: Option<f64>,
    pub common_elements: Vec<String>,
    pub design_inconsistencies: Vec<String>,
    pub user_journey_gaps: Vec<String>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}
