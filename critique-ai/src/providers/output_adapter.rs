//! Model output → canonical schema
//!
//! Models wrap JSON in prose or fenced code blocks. This adapter finds the
//! JSON object, deserializes it into the canonical stage types and rejects
//! anything that does not fit. It never substitutes defaults for unusable
//! output.

use super::ProviderError;
use crate::models::{AiAnalysis, ContextProfile, ContextSource, VisionObservation};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Locate and parse the JSON object inside raw model text
pub fn extract_json(text: &str) -> Result<Value, ProviderError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::invalid("model returned empty output"));
    }

    let candidates = [
        Some(trimmed),
        fenced_block(trimmed),
        outer_braces(trimmed),
    ];

    for candidate in candidates.into_iter().flatten() {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    Err(ProviderError::invalid(format!(
        "no JSON object found in model output ({} chars)",
        trimmed.len()
    )))
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an info string such as `json`
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn outer_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_as<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, ProviderError> {
    serde_json::from_value(value)
        .map_err(|e| ProviderError::invalid(format!("{} does not match schema: {}", what, e)))
}

/// Confidence may arrive as 0-1 or as a percentage
fn normalize_confidence(raw: f64) -> f64 {
    let value = if raw > 1.0 { raw / 100.0 } else { raw };
    value.clamp(0.0, 1.0)
}

pub fn parse_context_profile(text: &str) -> Result<ContextProfile, ProviderError> {
    let mut profile: ContextProfile = parse_as(extract_json(text)?, "context profile")?;
    if profile.primary_type.trim().is_empty() {
        return Err(ProviderError::invalid("context profile has no primary type"));
    }
    profile.primary_type = profile.primary_type.trim().to_lowercase();
    profile.confidence = normalize_confidence(profile.confidence);
    profile.source = ContextSource::Provider;
    Ok(profile)
}

pub fn parse_vision_observation(
    text: &str,
    provider: &str,
    subject_id: &str,
) -> Result<VisionObservation, ProviderError> {
    let mut observation: VisionObservation =
        parse_as(extract_json(text)?, "vision observation")?;
    observation.provider = provider.to_string();
    if observation.subject_id.is_empty() {
        observation.subject_id = subject_id.to_string();
    }
    observation.confidence = observation.confidence.map(normalize_confidence);
    Ok(observation)
}

pub fn parse_ai_analysis(text: &str) -> Result<AiAnalysis, ProviderError> {
    let mut analysis: AiAnalysis = parse_as(extract_json(text)?, "analysis")?;

    let has_content = !analysis.summary.trim().is_empty()
        || !analysis.annotations.is_empty()
        || !analysis.suggestions.is_empty()
        || !analysis.category_scores.is_empty()
        || !analysis.per_image.is_empty();
    if !has_content {
        return Err(ProviderError::invalid("analysis output is empty"));
    }

    analysis.confidence = analysis.confidence.map(normalize_confidence);
    for score in analysis.category_scores.values_mut() {
        *score = score.clamp(0.0, 100.0);
    }
    for image in &mut analysis.per_image {
        for score in image.category_scores.values_mut() {
            *score = score.clamp(0.0, 100.0);
        }
    }
    if let Some(cross) = analysis.cross_image.as_mut() {
        cross.thematic_coherence = cross.thematic_coherence.map(|v| v.clamp(0.0, 100.0));
        cross.user_flow_continuity = cross.user_flow_continuity.map(|v| v.clamp(0.0, 100.0));
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderErrorKind;

    #[test]
    fn test_extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"primaryType\": \"Dashboard\", \"confidence\": 85}\n```\nThanks";
        let profile = parse_context_profile(text).unwrap();
        assert_eq!(profile.primary_type, "dashboard");
        assert!((profile.confidence - 0.85).abs() < 1e-9);
        assert_eq!(profile.source, ContextSource::Provider);
    }

    #[test]
    fn test_extracts_braces_from_prose() {
        let value = extract_json("Result: {\"summary\": \"ok\"} end").unwrap();
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn test_malformed_output_is_error() {
        let err = parse_ai_analysis("I could not analyze this image.").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);

        assert!(parse_ai_analysis("{}").is_err());
        assert!(parse_ai_analysis("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_ai_analysis_accepts_camel_case() {
        let text = r#"{
            "overallSummary": "Clear layout",
            "categoryScores": {"usability": 140, "visual": 72},
            "recommendations": [{"title": "Raise contrast", "priority": "high"}],
            "annotations": [{"title": "Tiny labels", "severity": "moderate", "boundingBox": {"x": 0.1, "y": 0.2, "width": 0.3, "height": 0.1}}],
            "confidence": 0.8,
            "unknownField": true
        }"#;
        let analysis = parse_ai_analysis(text).unwrap();
        assert_eq!(analysis.summary, "Clear layout");
        assert_eq!(analysis.category_scores["usability"], 100.0);
        assert_eq!(analysis.suggestions.len(), 1);
        assert!(analysis.annotations[0].region.is_some());
    }

    #[test]
    fn test_vision_observation_fills_provider_and_subject() {
        let observation =
            parse_vision_observation(r#"{"uiElements": ["chart", "nav"]}"#, "openai", "img-1")
                .unwrap();
        assert_eq!(observation.provider, "openai");
        assert_eq!(observation.subject_id, "img-1");
        assert_eq!(observation.elements, vec!["chart", "nav"]);
    }
}
