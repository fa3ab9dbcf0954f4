//! Data models for the analysis pipeline

pub mod analysis;
pub mod event;
pub mod group;
pub mod job;
pub mod stage_output;

pub use analysis::{
    AnalysisPayload, AnalysisResult, ExistingInfo, ResultStatus, StoreOutcome, StoreRequest,
};
pub use event::{event_name, Event, EventPhase, NewEvent};
pub use group::{
    GroupAnalysisResult, GroupContext, GroupPatterns, GroupSummary, PerImageResult, SessionStatus,
};
pub use job::{
    GroupJob, Job, JobRef, JobState, JobStatus, NewGroupJob, NewJob, Stage, DEFAULT_ANALYSIS_TYPE,
};
pub use stage_output::{
    mean_score, AiAnalysis, AiStageOutput, Annotation, CategoryScores, ContextProfile, ContextSource,
    ContextStageOutput, CrossImageAssessment, ImageAssessment, ProviderOutcome, Region, Severity,
    Suggestion, VisionObservation, VisionStageOutput,
};
