//! Provider request builders
//!
//! Prompts ask for a single JSON object in the canonical stage output schema
//! so the output adapter can parse every provider the same way.

use super::WorkUnit;
use crate::models::{ContextProfile, VisionStageOutput};
use crate::providers::ProviderRequest;
use serde_json::json;

const CONTEXT_SYSTEM: &str = "You classify user interface screenshots. \
Answer with one JSON object and nothing else.";

const VISION_SYSTEM: &str = "You inspect one user interface screenshot and list what is on it. \
Answer with one JSON object and nothing else.";

const AI_SYSTEM: &str = "You are a senior product designer reviewing user interface designs. \
Answer with one JSON object and nothing else.";

pub(super) fn context_request(model: &str, unit: &WorkUnit) -> ProviderRequest {
    let subjects = unit.subjects();
    let prompt = format!(
        "Classify the screen type of the attached design(s).\n\
         Context from the requester: {}\n\
         Respond as {{\"primary_type\": string, \"confidence\": 0-1, \
         \"audience\": string|null, \"goals\": [string]}}.",
        unit.context_text().unwrap_or("none")
    );
    ProviderRequest {
        model: model.to_string(),
        image_payload: subjects.iter().map(|(_, url)| url.to_string()).collect(),
        prompt,
        system_prompt: Some(CONTEXT_SYSTEM.to_string()),
    }
}

pub(super) fn vision_request(
    model: &str,
    subject_id: &str,
    subject_url: &str,
    profile: &ContextProfile,
) -> ProviderRequest {
    let prompt = format!(
        "Screen id: {}\nExpected screen type: {}\n\
         List the visible interface elements, any readable text and notable visual issues.\n\
         Respond as {{\"subject_id\": string, \"elements\": [string], \
         \"detected_text\": [string], \"notes\": [string], \"confidence\": 0-1}}.",
        subject_id, profile.primary_type
    );
    ProviderRequest {
        model: model.to_string(),
        image_payload: vec![subject_url.to_string()],
        prompt,
        system_prompt: Some(VISION_SYSTEM.to_string()),
    }
}

pub(super) fn ai_request(
    model: &str,
    unit: &WorkUnit,
    profile: &ContextProfile,
    vision: &VisionStageOutput,
) -> ProviderRequest {
    let subjects = unit.subjects();
    let observations = json!(vision.observations);
    let mut prompt = format!(
        "Review the attached design(s).\n\
         Screen type: {} (confidence {:.2})\n\
         Audience: {}\n\
         Goals: {}\n\
         Requester context: {}\n\
         Observations from vision models: {}\n",
        profile.primary_type,
        profile.confidence,
        profile.audience.as_deref().unwrap_or("unknown"),
        if profile.goals.is_empty() {
            "unspecified".to_string()
        } else {
            profile.goals.join("; ")
        },
        unit.context_text().unwrap_or("none"),
        observations,
    );
    if let Some(extra) = unit.prompt() {
        prompt.push_str(&format!("Reviewer focus: {}\n", extra));
    }

    prompt.push_str(
        "Respond as {\"summary\": string, \"confidence\": 0-1, \
         \"category_scores\": {category: 0-100}, \
         \"annotations\": [{\"subject_id\": string, \"title\": string, \"description\": string, \
         \"severity\": \"low\"|\"medium\"|\"high\"|\"critical\", \"category\": string}], \
         \"suggestions\": [{\"title\": string, \"description\": string, \
         \"priority\": \"low\"|\"medium\"|\"high\"|\"critical\"}]",
    );
    if subjects.len() > 1 || matches!(unit, WorkUnit::Group(_)) {
        let ids: Vec<&str> = subjects.iter().map(|(id, _)| *id).collect();
        prompt.push_str(&format!(
            ", \"per_image\": [{{\"subject_id\": one of {:?}, \"category_scores\": {{}}, \
             \"elements\": [string], \"inconsistencies\": [string], \"journey_gaps\": [string], \
             \"insights\": [string]}}], \
             \"cross_image\": {{\"thematic_coherence\": 0-100, \"user_flow_continuity\": 0-100, \
             \"common_elements\": [string], \"design_inconsistencies\": [string], \
             \"user_journey_gaps\": [string], \"insights\": [string], \"recommendations\": [string]}}",
            ids
        ));
    }
    prompt.push_str("}.");

    ProviderRequest {
        model: model.to_string(),
        image_payload: subjects.iter().map(|(_, url)| url.to_string()).collect(),
        prompt,
        system_prompt: Some(AI_SYSTEM.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContextSource, GroupJob, Job, NewGroupJob, NewJob};

    fn profile() -> ContextProfile {
        ContextProfile {
            primary_type: "dashboard".into(),
            confidence: 0.8,
            audience: None,
            goals: vec![],
            source: ContextSource::Detector,
        }
    }

    #[test]
    fn test_single_ai_request_has_no_group_schema() {
        let unit = WorkUnit::Single(Job::new(NewJob {
            subject_id: "img-1".into(),
            subject_url: "https://cdn.example/img-1.png".into(),
            user_context: Some("admin dashboard".into()),
            analysis_type: None,
        }));
        let request = ai_request("m", &unit, &profile(), &VisionStageOutput::default());
        assert_eq!(request.image_payload, vec!["https://cdn.example/img-1.png"]);
        assert!(request.prompt.contains("admin dashboard"));
        assert!(!request.prompt.contains("cross_image"));
    }

    #[test]
    fn test_group_ai_request_sends_all_images_once() {
        let unit = WorkUnit::Group(GroupJob::new(NewGroupJob {
            group_id: None,
            subject_ids: vec!["a".into(), "b".into()],
            subject_urls: vec!["u-a".into(), "u-b".into()],
            group_context: None,
            prompt: Some("checkout flow".into()),
            session_id: None,
        }));
        let request = ai_request("m", &unit, &profile(), &VisionStageOutput::default());
        assert_eq!(request.image_payload, vec!["u-a", "u-b"]);
        assert!(request.prompt.contains("cross_image"));
        assert!(request.prompt.contains("checkout flow"));
    }

    #[test]
    fn test_vision_request_targets_one_image() {
        let request = vision_request("m", "img-1", "u-1", &profile());
        assert_eq!(request.image_payload, vec!["u-1"]);
        assert!(request.prompt.contains("img-1"));
    }
}
