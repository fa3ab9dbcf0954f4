//! Job and GroupJob state machine types
//!
//! Both work units share the same five-stage shape:
//! CONTEXT → VISION → AI → SYNTHESIS → COMPLETED, with `failed` and
//! `cancelled` as absorbing terminal states.

use chrono::{DateTime, Utc};
use critique_common::events::JobKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default analysis kind for single-image jobs
pub const DEFAULT_ANALYSIS_TYPE: &str = "design_review";

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Row created, first stage not yet entered
    Pending,
    /// A stage handler holds the job
    Processing,
    /// Synthesis persisted a result
    Completed,
    /// A stage failed
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Screen type / audience detection
    Context,
    /// Vision provider fan-out
    Vision,
    /// The single required model call
    Ai,
    /// Result assembly, scoring and persistence
    Synthesis,
    /// Terminal marker stage
    Completed,
}

impl Stage {
    /// The four work stages in execution order
    pub const PIPELINE: [Stage; 4] = [Stage::Context, Stage::Vision, Stage::Ai, Stage::Synthesis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Context => "context",
            Stage::Vision => "vision",
            Stage::Ai => "ai",
            Stage::Synthesis => "synthesis",
            Stage::Completed => "completed",
        }
    }

    /// Stage that follows this one (`None` for `Completed`)
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Context => Some(Stage::Vision),
            Stage::Vision => Some(Stage::Ai),
            Stage::Ai => Some(Stage::Synthesis),
            Stage::Synthesis => Some(Stage::Completed),
            Stage::Completed => None,
        }
    }

    /// True for stages that have a handler
    pub fn is_work_stage(&self) -> bool {
        !matches!(self, Stage::Completed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context" => Ok(Stage::Context),
            "vision" => Ok(Stage::Vision),
            "ai" => Ok(Stage::Ai),
            "synthesis" => Ok(Stage::Synthesis),
            "completed" => Ok(Stage::Completed),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Typed reference to either a Job or a GroupJob
///
/// Events carry exactly one of these, which is how the job XOR group-job
/// rule is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobRef {
    Single(Uuid),
    Group(Uuid),
}

impl JobRef {
    pub fn id(&self) -> Uuid {
        match self {
            JobRef::Single(id) | JobRef::Group(id) => *id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobRef::Single(_) => JobKind::Single,
            JobRef::Group(_) => JobKind::Group,
        }
    }

    /// Event name domain (`analysis/...` or `group-analysis/...`)
    pub fn domain(&self) -> &'static str {
        match self {
            JobRef::Single(_) => "analysis",
            JobRef::Group(_) => "group-analysis",
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRef::Single(id) => write!(f, "job:{}", id),
            JobRef::Group(id) => write!(f, "group-job:{}", id),
        }
    }
}

/// State-machine columns shared by Job and GroupJob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    pub current_stage: Stage,
    /// 0-100, non-decreasing within one attempt
    pub progress: u8,
    pub error: Option<String>,
    /// Processing run counter, starts at 1, bumped by retry
    pub attempt: u32,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            current_stage: Stage::Context,
            progress: 0,
            error: None,
            attempt: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-image analysis job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub subject_id: String,
    pub subject_url: String,
    pub user_context: Option<String>,
    pub analysis_type: String,
    #[serde(flatten)]
    pub state: JobState,
    /// Persisted AnalysisResult id once completed
    pub result_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject_id: request.subject_id,
            subject_url: request.subject_url,
            user_context: request.user_context,
            analysis_type: request
                .analysis_type
                .unwrap_or_else(|| DEFAULT_ANALYSIS_TYPE.to_string()),
            state: JobState::new(),
            result_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef::Single(self.id)
    }
}

/// Multi-image analysis job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJob {
    pub id: Uuid,
    pub group_id: String,
    pub subject_ids: Vec<String>,
    /// Parallel to `subject_ids`
    pub subject_urls: Vec<String>,
    pub group_context: Option<String>,
    pub prompt: Option<String>,
    /// Pre-allocated session this job fills (set for forks)
    pub session_id: Option<Uuid>,
    #[serde(flatten)]
    pub state: JobState,
    pub result_session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GroupJob {
    pub fn new(request: NewGroupJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            group_id: request
                .group_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            subject_ids: request.subject_ids,
            subject_urls: request.subject_urls,
            group_context: request.group_context,
            prompt: request.prompt,
            session_id: request.session_id,
            state: JobState::new(),
            result_session_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef::Group(self.id)
    }

    /// (subject_id, subject_url) pairs in request order
    pub fn subjects(&self) -> impl Iterator<Item = (&str, &str)> {
        self.subject_ids
            .iter()
            .map(String::as_str)
            .zip(self.subject_urls.iter().map(String::as_str))
    }
}

/// Request to create a single-image job
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub subject_id: String,
    pub subject_url: String,
    #[serde(default)]
    pub user_context: Option<String>,
    #[serde(default)]
    pub analysis_type: Option<String>,
}

impl NewJob {
    /// Reject malformed requests before any stage runs
    pub fn validate(&self) -> Result<(), String> {
        if self.subject_id.trim().is_empty() {
            return Err("subject_id must not be empty".to_string());
        }
        if self.subject_url.trim().is_empty() {
            return Err("subject_url must not be empty".to_string());
        }
        if let Some(kind) = &self.analysis_type {
            if kind.trim().is_empty() {
                return Err("analysis_type must not be blank".to_string());
            }
        }
        Ok(())
    }
}

/// Request to create a group job
#[derive(Debug, Clone, Deserialize)]
pub struct NewGroupJob {
    #[serde(default)]
    pub group_id: Option<String>,
    pub subject_ids: Vec<String>,
    #[serde(default)]
    pub subject_urls: Vec<String>,
    #[serde(default)]
    pub group_context: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(skip)]
    pub session_id: Option<Uuid>,
}

impl NewGroupJob {
    /// Reject malformed requests before any stage runs
    pub fn validate(&self) -> Result<(), String> {
        if self.subject_ids.is_empty() {
            return Err("subject_ids must not be empty".to_string());
        }
        if self.subject_ids.iter().any(|id| id.trim().is_empty()) {
            return Err("subject_ids must not contain blank ids".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.subject_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(format!("duplicate subject id '{}'", dup));
        }
        if self.subject_urls.len() != self.subject_ids.len() {
            return Err(format!(
                "subject_urls has {} entries, expected {}",
                self.subject_urls.len(),
                self.subject_ids.len()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Context.next(), Some(Stage::Vision));
        assert_eq!(Stage::Vision.next(), Some(Stage::Ai));
        assert_eq!(Stage::Ai.next(), Some(Stage::Synthesis));
        assert_eq!(Stage::Synthesis.next(), Some(Stage::Completed));
        assert_eq!(Stage::Completed.next(), None);
        assert!(!Stage::Completed.is_work_stage());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(NewJob {
            subject_id: "img-1".to_string(),
            subject_url: "https://cdn.example/img-1.png".to_string(),
            user_context: None,
            analysis_type: None,
        });
        assert_eq!(job.state.status, JobStatus::Pending);
        assert_eq!(job.state.current_stage, Stage::Context);
        assert_eq!(job.state.progress, 0);
        assert_eq!(job.state.attempt, 1);
        assert_eq!(job.analysis_type, DEFAULT_ANALYSIS_TYPE);
    }

    #[test]
    fn test_group_validation() {
        let mut request = NewGroupJob {
            group_id: None,
            subject_ids: vec![],
            subject_urls: vec![],
            group_context: None,
            prompt: None,
            session_id: None,
        };
        assert!(request.validate().is_err());

        request.subject_ids = vec!["a".into(), "a".into()];
        request.subject_urls = vec!["u1".into(), "u2".into()];
        assert!(request.validate().unwrap_err().contains("duplicate"));

        request.subject_ids = vec!["a".into(), "b".into()];
        request.subject_urls = vec!["u1".into()];
        assert!(request.validate().is_err());

        request.subject_urls.push("u2".into());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_job_ref_domains() {
        let id = Uuid::new_v4();
        assert_eq!(JobRef::Single(id).domain(), "analysis");
        assert_eq!(JobRef::Group(id).domain(), "group-analysis");
        assert_eq!(JobRef::Group(id).id(), id);
    }
}
