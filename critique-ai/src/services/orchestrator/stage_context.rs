use super::{prompts, StageCommit, StageOrchestrator};
use crate::config::ProviderRole;
use crate::error::PipelineResult;
use crate::models::{ContextStageOutput, JobRef};
use crate::providers::output_adapter;
use crate::services::context_detector;
use tracing::{debug, warn};

impl StageOrchestrator {
    /// Context stage: a configured context provider wins when its answer
    /// parses; otherwise (or on any provider failure) the keyword detector.
    pub(super) async fn stage_context(
        &self,
        job_ref: JobRef,
        _attempt: u32,
    ) -> PipelineResult<StageCommit> {
        let unit = self.load_unit(job_ref).await?;
        let urls: Vec<&str> = unit.subjects().into_iter().map(|(_, url)| url).collect();
        let detected = context_detector::detect(unit.context_text(), &urls);

        let output = match self.gateway.binding_for(ProviderRole::Context) {
            None => ContextStageOutput {
                profile: detected,
                outcome: None,
            },
            Some(binding) => {
                let request = prompts::context_request(&binding.model, &unit);
                let (result, mut outcome) = self
                    .gateway
                    .invoke_tracked(&binding.operation_key(), None, &request)
                    .await;

                match result.and_then(|text| output_adapter::parse_context_profile(&text)) {
                    Ok(profile) => {
                        debug!(job = %job_ref, primary_type = %profile.primary_type, "Context from provider");
                        ContextStageOutput {
                            profile,
                            outcome: Some(outcome),
                        }
                    }
                    Err(err) => {
                        warn!(
                            job = %job_ref,
                            operation_key = %outcome.operation_key,
                            error_kind = %err.kind,
                            "Context provider failed, using keyword detector: {}",
                            err.message
                        );
                        outcome.succeeded = false;
                        outcome.error_kind = Some(err.kind);
                        outcome.error = Some(err.message);
                        ContextStageOutput {
                            profile: detected,
                            outcome: Some(outcome),
                        }
                    }
                }
            }
        };

        Ok(StageCommit::Advance(serde_json::to_value(output)?))
    }
}
