//! Pipeline services

pub mod context_detector;
pub mod dispatch;
pub mod event_log;
pub mod group_aggregator;
pub mod orchestrator;
pub mod quality_scorer;
pub mod version_manager;

pub use dispatch::{stage_queue, QueueDispatcher, StageDispatcher, StageTask, StageWorkerPool};
pub use event_log::EventLog;
pub use group_aggregator::{GroupAggregate, GroupAggregator};
pub use orchestrator::{ForkOutcome, PipelineContext, ResumePoint, StageOrchestrator, StageRun};
pub use quality_scorer::{QualityScore, QualityScorer, StageOutcomes};
pub use version_manager::VersionManager;
