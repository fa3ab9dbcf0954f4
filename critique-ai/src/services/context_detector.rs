//! Keyword-based context detection
//!
//! Local fallback for the context stage: guesses the screen type, audience
//! and goals from the user/group context text and the subject URL.

use crate::models::{ContextProfile, ContextSource};

/// (screen type, keywords, default goals)
const SCREEN_TYPES: &[(&str, &[&str], &[&str])] = &[
    (
        "dashboard",
        &["dashboard", "analytics", "metrics", "kpi", "chart", "report", "admin panel"],
        &["surface key metrics at a glance", "support quick drill-down"],
    ),
    (
        "landing_page",
        &["landing", "hero", "marketing", "homepage", "home page", "signup page"],
        &["communicate the value proposition", "drive sign-ups"],
    ),
    (
        "e_commerce",
        &["checkout", "cart", "product", "shop", "store", "pricing", "e-commerce", "ecommerce"],
        &["reduce purchase friction", "build buyer trust"],
    ),
    (
        "form",
        &["form", "sign up", "registration", "login", "log in", "input", "survey"],
        &["minimize input errors", "keep completion effort low"],
    ),
    (
        "mobile_app",
        &["mobile", "ios", "android", "app screen", "tab bar"],
        &["support one-handed use", "keep touch targets reachable"],
    ),
    (
        "settings",
        &["settings", "preferences", "configuration", "account page", "profile"],
        &["make options discoverable", "prevent accidental changes"],
    ),
    (
        "onboarding",
        &["onboarding", "welcome", "tutorial", "walkthrough", "first run"],
        &["shorten time to first value", "explain core concepts"],
    ),
    (
        "content",
        &["blog", "article", "documentation", "docs", "news", "content"],
        &["keep long text readable", "support scanning"],
    ),
];

const AUDIENCES: &[(&str, &[&str])] = &[
    ("internal operators", &["admin", "internal", "ops", "back office", "backoffice"]),
    ("developers", &["developer", "api", "engineer", "technical"]),
    ("enterprise buyers", &["enterprise", "b2b", "business"]),
    ("consumers", &["consumer", "customer", "shopper", "b2c", "user-facing"]),
];

const FALLBACK_TYPE: &str = "general";
const FALLBACK_CONFIDENCE: f64 = 0.4;

/// Detect a context profile from free text plus URLs
pub fn detect(context: Option<&str>, subject_urls: &[&str]) -> ContextProfile {
    let mut haystack = context.unwrap_or_default().to_lowercase();
    for url in subject_urls {
        haystack.push(' ');
        haystack.push_str(&url.to_lowercase().replace(['-', '_', '/'], " "));
    }

    let best = SCREEN_TYPES
        .iter()
        .map(|(name, keywords, goals)| {
            let hits = keywords.iter().filter(|k| haystack.contains(*k)).count();
            (hits, *name, *goals)
        })
        .filter(|(hits, _, _)| *hits > 0)
        // Ties keep table order
        .fold(None::<(usize, &str, &[&str])>, |best, candidate| match best {
            Some(b) if b.0 >= candidate.0 => Some(b),
            _ => Some(candidate),
        });

    let audience = AUDIENCES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(*k)))
        .map(|(name, _)| name.to_string());

    match best {
        Some((hits, name, goals)) => ContextProfile {
            primary_type: name.to_string(),
            confidence: (0.5 + 0.15 * hits as f64).min(0.95),
            audience,
            goals: goals.iter().map(|g| g.to_string()).collect(),
            source: ContextSource::Detector,
        },
        None => ContextProfile {
            primary_type: FALLBACK_TYPE.to_string(),
            confidence: FALLBACK_CONFIDENCE,
            audience,
            goals: Vec::new(),
            source: ContextSource::Detector,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_detected() {
        let profile = detect(Some("Admin dashboard for the ops team"), &[]);
        assert_eq!(profile.primary_type, "dashboard");
        assert!(profile.confidence >= 0.6);
        assert_eq!(profile.audience.as_deref(), Some("internal operators"));
        assert_eq!(profile.source, ContextSource::Detector);
    }

    #[test]
    fn test_url_contributes() {
        let profile = detect(None, &["https://cdn.example/shop/checkout-step-2.png"]);
        assert_eq!(profile.primary_type, "e_commerce");
    }

    #[test]
    fn test_more_hits_raise_confidence() {
        let one = detect(Some("dashboard"), &[]);
        let three = detect(Some("dashboard with charts and kpi tiles"), &[]);
        assert!(three.confidence > one.confidence);
        assert!(three.confidence <= 0.95);
    }

    #[test]
    fn test_no_keywords_falls_back() {
        let profile = detect(Some("please review"), &[]);
        assert_eq!(profile.primary_type, "general");
        assert!(profile.confidence < 0.6);
        assert!(profile.goals.is_empty());
    }
}
