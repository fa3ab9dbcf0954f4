use super::{StageCommit, StageOrchestrator, WorkUnit};
use crate::db;
use crate::error::PipelineResult;
use crate::models::{
    AiStageOutput, AnalysisPayload, ContextStageOutput, GroupContext, GroupJob, Job, JobRef,
    PerImageResult, Stage, StoreRequest, VisionStageOutput,
};
use crate::services::group_aggregator::GroupAggregator;
use crate::services::quality_scorer::{QualityScore, StageOutcomes};
use serde_json::json;
use tracing::{debug, info};

/// Inputs rebuilt from the event log
struct SynthesisInputs {
    context: ContextStageOutput,
    vision: VisionStageOutput,
    ai: AiStageOutput,
}

impl SynthesisInputs {
    fn outcomes(&self) -> StageOutcomes {
        StageOutcomes {
            context_confidence: Some(self.context.profile.confidence),
            context_degraded: self
                .context
                .outcome
                .as_ref()
                .map(|o| !o.succeeded)
                .unwrap_or(false),
            vision_attempted: self.vision.attempted(),
            vision_succeeded: self.vision.succeeded(),
            ai_succeeded: true,
            ai_confidence: self.ai.analysis.confidence,
            synthesis_succeeded: true,
        }
    }
}

impl StageOrchestrator {
    /// Synthesis stage: score, persist the result, complete the job
    pub(super) async fn stage_synthesis(
        &self,
        job_ref: JobRef,
        attempt: u32,
    ) -> PipelineResult<StageCommit> {
        let inputs = SynthesisInputs {
            context: self.require_output(job_ref, attempt, Stage::Context).await?,
            vision: self.require_output(job_ref, attempt, Stage::Vision).await?,
            ai: self.require_output(job_ref, attempt, Stage::Ai).await?,
        };
        let score = self.scorer.score(&inputs.outcomes());

        // Results are persisted outside the completion transaction, so check
        // for a cancel before writing them
        if !self.still_running(job_ref, attempt).await? {
            return Ok(StageCommit::StandDown);
        }

        match self.load_unit(job_ref).await? {
            WorkUnit::Single(job) => self.persist_analysis(&job, &inputs, &score).await,
            WorkUnit::Group(job) => self.persist_group(&job, &inputs, &score).await,
        }
    }

    async fn persist_analysis(
        &self,
        job: &Job,
        inputs: &SynthesisInputs,
        score: &QualityScore,
    ) -> PipelineResult<StageCommit> {
        let mut provider_outcomes: Vec<_> = inputs.context.outcome.iter().cloned().collect();
        provider_outcomes.extend(inputs.vision.outcomes.iter().cloned());
        provider_outcomes.push(inputs.ai.outcome.clone());

        let analysis = &inputs.ai.analysis;
        let payload = AnalysisPayload {
            annotations: analysis.annotations.clone(),
            suggestions: analysis.suggestions.clone(),
            summary: analysis.summary.clone(),
            metadata: json!({
                "category_scores": analysis.category_scores,
                "confidence": analysis.confidence,
                "context": inputs.context.profile,
                "vision_observations": inputs.vision.observations,
                "provider_outcomes": provider_outcomes,
                "quality": score.breakdown,
            }),
        };

        let stored = self
            .versions
            .store(StoreRequest {
                subject_id: job.subject_id.clone(),
                analysis_type: job.analysis_type.clone(),
                user_context: job.user_context.clone(),
                payload,
                overall_quality: score.overall_quality,
                is_partial_result: score.is_partial_result,
                job_id: Some(job.id),
                force_new: false,
                within_hours: None,
            })
            .await?;

        info!(
            job_id = %job.id,
            analysis_id = %stored.id,
            version = stored.version,
            is_new = stored.is_new,
            "Analysis persisted"
        );
        // On a dedup hit the job reports the reused row; this run's score
        // is kept alongside
        Ok(StageCommit::Finish {
            result_id: stored.id,
            overall_quality: stored.overall_quality,
            is_partial_result: stored.is_partial_result,
            metadata: json!({
                "result_id": stored.id,
                "version": stored.version,
                "is_new": stored.is_new,
                "overall_quality": stored.overall_quality,
                "is_partial_result": stored.is_partial_result,
                "run_overall_quality": score.overall_quality,
                "run_is_partial_result": score.is_partial_result,
                "quality": score.breakdown,
            }),
        })
    }

    async fn persist_group(
        &self,
        job: &GroupJob,
        inputs: &SynthesisInputs,
        score: &QualityScore,
    ) -> PipelineResult<StageCommit> {
        // A re-run after a crash between persist and completion reuses the row
        if let Some(existing) = db::group_results::load_by_group_job(&self.db, job.id).await? {
            debug!(group_job_id = %job.id, session_id = %existing.session_id, "Group result already persisted");
            return Ok(group_finish(existing.session_id, existing.overall_quality, existing.is_partial_result));
        }

        let per_image = per_image_results(job, inputs);
        let cross = inputs.ai.analysis.cross_image.clone().unwrap_or_default();

        let parent_session_id = match job.session_id {
            Some(session_id) => self
                .aggregator
                .load(session_id)
                .await?
                .and_then(|s| s.parent_session_id),
            None => None,
        };

        let mut insights = cross.insights;
        if insights.is_empty() && !inputs.ai.analysis.summary.trim().is_empty() {
            insights.push(inputs.ai.analysis.summary.clone());
        }
        let mut recommendations = cross.recommendations;
        if recommendations.is_empty() {
            recommendations = inputs
                .ai
                .analysis
                .suggestions
                .iter()
                .map(|s| s.title.clone())
                .collect();
        }

        let context = GroupContext {
            group_id: job.group_id.clone(),
            group_job_id: Some(job.id),
            session_id: job.session_id,
            parent_session_id,
            prompt: job.prompt.clone(),
            group_context: job.group_context.clone(),
            thematic_coherence: cross.thematic_coherence,
            user_flow_continuity: cross.user_flow_continuity,
            common_elements: cross.common_elements,
            design_inconsistencies: cross.design_inconsistencies,
            user_journey_gaps: cross.user_journey_gaps,
            insights,
            recommendations,
        };

        let aggregate = GroupAggregator::aggregate(&per_image, &context);
        let mut result = aggregate.result;
        result.overall_quality = score.overall_quality;
        result.is_partial_result = score.is_partial_result || aggregate.is_partial;
        self.aggregator.save(&result).await?;

        info!(
            group_job_id = %job.id,
            session_id = %result.session_id,
            overall_score = result.summary.overall_score,
            consistency = result.summary.consistency,
            "Group result persisted"
        );
        Ok(group_finish(result.session_id, result.overall_quality, result.is_partial_result))
    }
}

fn group_finish(session_id: uuid::Uuid, overall_quality: u8, is_partial_result: bool) -> StageCommit {
    StageCommit::Finish {
        result_id: session_id,
        overall_quality,
        is_partial_result,
        metadata: json!({
            "session_id": session_id,
            "overall_quality": overall_quality,
            "is_partial_result": is_partial_result,
        }),
    }
}

/// One entry per subject, in request order, merging the ai assessment with
/// vision-detected elements
fn per_image_results(job: &GroupJob, inputs: &SynthesisInputs) -> Vec<PerImageResult> {
    let analysis = &inputs.ai.analysis;
    job.subject_ids
        .iter()
        .map(|subject_id| {
            let assessed = analysis
                .per_image
                .iter()
                .find(|a| a.subject_id == *subject_id);

            let mut result = match assessed {
                Some(a) => PerImageResult {
                    subject_id: subject_id.clone(),
                    category_scores: a.category_scores.clone(),
                    elements: a.elements.clone(),
                    inconsistencies: a.inconsistencies.clone(),
                    journey_gaps: a.journey_gaps.clone(),
                    insights: a.insights.clone(),
                },
                // A lone image may be scored only at the top level
                None if job.subject_ids.len() == 1 => PerImageResult {
                    subject_id: subject_id.clone(),
                    category_scores: analysis.category_scores.clone(),
                    ..Default::default()
                },
                None => PerImageResult {
                    subject_id: subject_id.clone(),
                    ..Default::default()
                },
            };

            for observation in inputs
                .vision
                .observations
                .iter()
                .filter(|o| o.subject_id == *subject_id)
            {
                for element in &observation.elements {
                    if !result
                        .elements
                        .iter()
                        .any(|e| e.eq_ignore_ascii_case(element))
                    {
                        result.elements.push(element.clone());
                    }
                }
            }
            result
        })
        .collect()
}
