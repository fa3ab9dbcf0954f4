//! Scripted model providers

use async_trait::async_trait;
use critique_ai::providers::{Provider, ProviderError, ProviderErrorKind, ProviderRequest};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Provider that replays queued results, then repeats a fallback forever
pub struct ScriptedProvider {
    name: String,
    queued: Mutex<VecDeque<(Duration, Result<String, ProviderError>)>>,
    fallback: Result<String, ProviderError>,
    calls: AtomicU32,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn replying(name: &str, text: impl Into<String>) -> Self {
        Self::with_fallback(name, Ok(text.into()))
    }

    pub fn failing(name: &str, kind: ProviderErrorKind) -> Self {
        Self::with_fallback(
            name,
            Err(ProviderError::new(kind, format!("{} scripted failure", name))),
        )
    }

    fn with_fallback(name: &str, fallback: Result<String, ProviderError>) -> Self {
        Self {
            name: name.to_string(),
            queued: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue `result` ahead of the fallback
    pub fn then(self, result: Result<String, ProviderError>) -> Self {
        self.then_after(Duration::ZERO, result)
    }

    /// Queue `result`, answered only after `delay`
    pub fn then_after(self, delay: Duration, result: Result<String, ProviderError>) -> Self {
        self.queued.lock().unwrap().push_back((delay, result));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let next = self.queued.lock().unwrap().pop_front();
        match next {
            Some((delay, result)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => self.fallback.clone(),
        }
    }
}

/// A vision observation as a model would write it
pub fn vision_reply() -> String {
    json!({
        "uiElements": ["header", "sidebar", "revenue chart", "filter bar"],
        "detectedText": ["Revenue", "Last 30 days"],
        "layoutNotes": ["dense three-column grid"],
        "confidence": 0.9
    })
    .to_string()
}

/// Single-image analysis wrapped in a fenced block, the way chat models answer
pub fn ai_reply() -> String {
    let body = json!({
        "summary": "Clear dashboard with a crowded filter area.",
        "annotations": [{
            "title": "Filter bar crowding",
            "description": "Seven filters compete with the primary chart.",
            "severity": "high",
            "category": "layout",
            "boundingBox": {"x": 0.05, "y": 0.1, "width": 0.9, "height": 0.08}
        }],
        "suggestions": [{
            "title": "Collapse secondary filters",
            "description": "Keep date range visible, move the rest into a drawer.",
            "priority": "medium"
        }],
        "categoryScores": {"layout": 68, "typography": 82, "accessibility": 74},
        "confidence": 0.85
    });
    format!("Here is my review:\n```json\n{}\n```", body)
}

/// Group analysis covering every subject id
pub fn group_ai_reply(subject_ids: &[&str]) -> String {
    let per_image: Vec<_> = subject_ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            json!({
                "subjectId": id,
                "categoryScores": {"layout": 70 + i * 5, "consistency": 80},
                "elements": ["nav bar", "primary button"],
                "inconsistencies": if i == 0 { vec![] } else { vec!["button radius differs"] },
                "insights": [format!("screen {} keeps the nav pattern", i + 1)]
            })
        })
        .collect();

    json!({
        "summary": "The flow is coherent with minor styling drift.",
        "suggestions": [{"title": "Unify button radius", "priority": "low"}],
        "categoryScores": {"layout": 75, "consistency": 80},
        "confidence": 0.8,
        "perImage": per_image,
        "crossImage": {
            "thematicCoherence": 82,
            "userFlowContinuity": 76,
            "commonElements": ["nav bar"],
            "designInconsistencies": ["button radius differs"],
            "userJourneyGaps": [],
            "insights": ["navigation is consistent across screens"],
            "recommendations": []
        }
    })
    .to_string()
}
