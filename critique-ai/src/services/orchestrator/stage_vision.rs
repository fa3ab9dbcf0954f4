use super::{prompts, StageCommit, StageOrchestrator};
use crate::config::ProviderRole;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ContextStageOutput, JobRef, Stage, VisionStageOutput};
use crate::providers::output_adapter;
use crate::providers::FanOutCall;
use tracing::{info, warn};

impl StageOrchestrator {
    /// Vision stage: every vision provider × every subject, concurrently
    ///
    /// Individual failures are recorded and tolerated. Total failure only
    /// fails the stage when `escalate_total_vision_failure` is set.
    pub(super) async fn stage_vision(
        &self,
        job_ref: JobRef,
        attempt: u32,
    ) -> PipelineResult<StageCommit> {
        let unit = self.load_unit(job_ref).await?;
        let context: ContextStageOutput = self
            .require_output(job_ref, attempt, Stage::Context)
            .await?;

        let bindings = self.gateway.bindings_for(ProviderRole::Vision);
        let mut calls = Vec::with_capacity(bindings.len() * unit.subjects().len());
        for binding in &bindings {
            for (subject_id, subject_url) in unit.subjects() {
                calls.push(FanOutCall {
                    provider: binding.name.clone(),
                    operation_key: binding.operation_key(),
                    subject_id: Some(subject_id.to_string()),
                    request: prompts::vision_request(
                        &binding.model,
                        subject_id,
                        subject_url,
                        &context.profile,
                    ),
                });
            }
        }

        let mut output = VisionStageOutput::default();
        for result in self.gateway.fan_out(calls).await {
            let mut outcome = result.outcome;
            if let Some(text) = result.output {
                let subject_id = outcome.subject_id.clone().unwrap_or_default();
                match output_adapter::parse_vision_observation(&text, &result.provider, &subject_id) {
                    Ok(observation) => output.observations.push(observation),
                    Err(err) => {
                        warn!(
                            job = %job_ref,
                            operation_key = %outcome.operation_key,
                            subject_id = %subject_id,
                            "Unparseable vision output: {}",
                            err.message
                        );
                        outcome.succeeded = false;
                        outcome.error_kind = Some(err.kind);
                        outcome.error = Some(err.message);
                    }
                }
            }
            output.outcomes.push(outcome);
        }

        info!(
            job = %job_ref,
            attempted = output.attempted(),
            succeeded = output.succeeded(),
            "Vision fan-out settled"
        );

        if self.config.escalate_total_vision_failure
            && output.attempted() > 0
            && output.succeeded() == 0
        {
            return Err(PipelineError::StageFailed {
                stage: Stage::Vision,
                message: format!("all {} vision provider calls failed", output.attempted()),
            });
        }

        Ok(StageCommit::Advance(serde_json::to_value(output)?))
    }
}
