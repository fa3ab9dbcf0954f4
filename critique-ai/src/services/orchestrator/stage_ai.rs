use super::{prompts, StageCommit, StageOrchestrator};
use crate::config::ProviderRole;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{AiStageOutput, ContextStageOutput, JobRef, Stage, VisionStageOutput};
use crate::providers::output_adapter;
use tracing::debug;

impl StageOrchestrator {
    /// AI stage: the one required model call
    ///
    /// Any failure here is fatal for the job, including output that does not
    /// parse into the analysis schema.
    pub(super) async fn stage_ai(
        &self,
        job_ref: JobRef,
        attempt: u32,
    ) -> PipelineResult<StageCommit> {
        let binding = self
            .gateway
            .binding_for(ProviderRole::Ai)
            .ok_or_else(|| PipelineError::FatalConfig("no ai provider configured".to_string()))?;

        let unit = self.load_unit(job_ref).await?;
        let context: ContextStageOutput = self
            .require_output(job_ref, attempt, Stage::Context)
            .await?;
        let vision: VisionStageOutput = self
            .require_output(job_ref, attempt, Stage::Vision)
            .await?;

        let request = prompts::ai_request(&binding.model, &unit, &context.profile, &vision);
        let (result, outcome) = self
            .gateway
            .invoke_tracked(&binding.operation_key(), None, &request)
            .await;

        let text = result.map_err(|err| {
            if err.is_fatal_config() {
                PipelineError::FatalConfig(err.message)
            } else {
                PipelineError::Provider(err)
            }
        })?;

        let analysis = output_adapter::parse_ai_analysis(&text).map_err(|err| {
            PipelineError::StageFailed {
                stage: Stage::Ai,
                message: format!("unparseable model output: {}", err.message),
            }
        })?;

        debug!(
            job = %job_ref,
            latency_ms = outcome.latency_ms,
            annotations = analysis.annotations.len(),
            "AI analysis parsed"
        );
        Ok(StageCommit::Advance(serde_json::to_value(AiStageOutput {
            analysis,
            outcome,
        })?))
    }
}
