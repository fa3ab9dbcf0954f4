//! Group Aggregator
//!
//! Combines per-image assessments into cross-image metrics, and manages
//! session forks.
//!
//! # Metrics
//! - **overall_score**: mean of per-image scores (each image's mean category score)
//! - **consistency**: `100 − 2 × population std-dev` of per-image scores, clamped
//! - **thematic_coherence / user_flow_continuity**: taken from the ai stage's
//!   cross-image assessment; never computed locally. Absent → 0 and partial.
//! - **common_elements**: intersection of per-image elements plus ai-reported ones
//! - **design_inconsistencies / user_journey_gaps**: ordered unions

use crate::db;
use crate::models::{
    mean_score, GroupAnalysisResult, GroupContext, GroupPatterns, GroupSummary, PerImageResult,
    SessionStatus,
};
use chrono::Utc;
use critique_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Lineage walks stop here even if rows form a cycle
const MAX_LINEAGE_DEPTH: usize = 64;

/// Aggregate plus the flag telling whether any input was missing
#[derive(Debug, Clone)]
pub struct GroupAggregate {
    pub result: GroupAnalysisResult,
    pub is_partial: bool,
}

#[derive(Clone)]
pub struct GroupAggregator {
    db: SqlitePool,
}

impl GroupAggregator {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Combine per-image results into one session result
    ///
    /// `overall_quality` is left at 0 for the caller to fill from the
    /// quality scorer.
    pub fn aggregate(per_image: &[PerImageResult], context: &GroupContext) -> GroupAggregate {
        let mut is_partial = false;

        let scores: Vec<f64> = per_image
            .iter()
            .filter_map(|image| mean_score(&image.category_scores))
            .collect();
        if scores.len() < per_image.len() || scores.is_empty() {
            is_partial = true;
        }

        let (overall_score, consistency) = if scores.is_empty() {
            (0.0, 0.0)
        } else {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            let variance =
                scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
            let consistency = (100.0 - variance.sqrt() * 2.0).clamp(0.0, 100.0);
            (mean, consistency)
        };

        let thematic_coherence = context.thematic_coherence.unwrap_or_else(|| {
            is_partial = true;
            0.0
        });
        let user_flow_continuity = context.user_flow_continuity.unwrap_or_else(|| {
            is_partial = true;
            0.0
        });

        let mut common_elements = intersect_elements(per_image);
        extend_unique(&mut common_elements, &context.common_elements);

        let mut design_inconsistencies = Vec::new();
        let mut user_journey_gaps = Vec::new();
        let mut insights = context.insights.clone();
        for image in per_image {
            extend_unique(&mut design_inconsistencies, &image.inconsistencies);
            extend_unique(&mut user_journey_gaps, &image.journey_gaps);
        }
        extend_unique(&mut design_inconsistencies, &context.design_inconsistencies);
        extend_unique(&mut user_journey_gaps, &context.user_journey_gaps);
        dedup_in_place(&mut insights);
        for image in per_image {
            extend_unique(&mut insights, &image.insights);
        }
        let mut recommendations = context.recommendations.clone();
        dedup_in_place(&mut recommendations);

        let now = Utc::now();
        let result = GroupAnalysisResult {
            id: Uuid::new_v4(),
            session_id: context.session_id.unwrap_or_else(Uuid::new_v4),
            group_id: context.group_id.clone(),
            group_job_id: context.group_job_id,
            status: SessionStatus::Completed,
            prompt: context.prompt.clone(),
            group_context: context.group_context.clone(),
            summary: GroupSummary {
                overall_score: round1(overall_score),
                consistency: round1(consistency),
                thematic_coherence: round1(thematic_coherence),
                user_flow_continuity: round1(user_flow_continuity),
            },
            insights,
            recommendations,
            patterns: GroupPatterns {
                common_elements,
                design_inconsistencies,
                user_journey_gaps,
            },
            overall_quality: 0,
            is_partial_result: is_partial,
            parent_session_id: context.parent_session_id,
            created_at: now,
            updated_at: now,
        };

        GroupAggregate { result, is_partial }
    }

    /// Persist a completed aggregate, filling a pre-allocated session if any
    pub async fn save(&self, result: &GroupAnalysisResult) -> Result<()> {
        if db::group_results::complete_session(&self.db, result).await? {
            return Ok(());
        }
        if db::group_results::load_session(&self.db, result.session_id)
            .await?
            .is_some()
        {
            return Err(Error::InvalidInput(format!(
                "session {} is already completed",
                result.session_id
            )));
        }
        db::group_results::insert_session(&self.db, result).await
    }

    /// Create a pending child of `source` and return its session id
    ///
    /// The source row is never modified.
    pub async fn fork(&self, source_session_id: Uuid, prompt: Option<String>) -> Result<Uuid> {
        let source = db::group_results::load_session(&self.db, source_session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group session {}", source_session_id)))?;

        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let child = GroupAnalysisResult {
            id: Uuid::new_v4(),
            session_id,
            group_id: source.group_id.clone(),
            group_job_id: None,
            status: SessionStatus::Pending,
            prompt: prompt.or(source.prompt.clone()),
            group_context: source.group_context.clone(),
            summary: GroupSummary::default(),
            insights: Vec::new(),
            recommendations: Vec::new(),
            patterns: GroupPatterns::default(),
            overall_quality: 0,
            is_partial_result: false,
            parent_session_id: Some(source.session_id),
            created_at: now,
            updated_at: now,
        };
        db::group_results::insert_session(&self.db, &child).await?;

        info!(
            source_session_id = %source_session_id,
            session_id = %session_id,
            "Forked group session"
        );
        Ok(session_id)
    }

    /// Drop a fork whose group job could not be started
    pub async fn discard_fork(&self, session_id: Uuid) -> Result<bool> {
        db::group_results::delete_pending_session(&self.db, session_id).await
    }

    /// Ancestors of a session, nearest first
    pub async fn lineage(&self, session_id: Uuid) -> Result<Vec<GroupAnalysisResult>> {
        let start = db::group_results::load_session(&self.db, session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group session {}", session_id)))?;

        let mut ancestors = Vec::new();
        let mut seen = HashSet::from([start.session_id]);
        let mut next = start.parent_session_id;

        while let Some(parent_id) = next {
            if !seen.insert(parent_id) || ancestors.len() >= MAX_LINEAGE_DEPTH {
                warn!(session_id = %session_id, "Session lineage is cyclic or too deep, truncating");
                break;
            }
            match db::group_results::load_session(&self.db, parent_id).await? {
                Some(parent) => {
                    next = parent.parent_session_id;
                    ancestors.push(parent);
                }
                None => break,
            }
        }
        Ok(ancestors)
    }

    pub async fn load(&self, session_id: Uuid) -> Result<Option<GroupAnalysisResult>> {
        db::group_results::load_session(&self.db, session_id).await
    }
}

/// Elements present in every image, in the first image's order
fn intersect_elements(per_image: &[PerImageResult]) -> Vec<String> {
    let Some((first, rest)) = per_image.split_first() else {
        return Vec::new();
    };
    let others: Vec<HashSet<String>> = rest
        .iter()
        .map(|image| image.elements.iter().map(|e| normalize(e)).collect())
        .collect();

    let mut common = Vec::new();
    for element in &first.elements {
        let key = normalize(element);
        if others.iter().all(|set| set.contains(&key)) {
            extend_unique(&mut common, std::slice::from_ref(element));
        }
    }
    common
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Append items not already present (case-insensitive)
fn extend_unique(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        let key = normalize(item);
        if key.is_empty() {
            continue;
        }
        if !target.iter().any(|existing| normalize(existing) == key) {
            target.push(item.trim().to_string());
        }
    }
}

fn dedup_in_place(items: &mut Vec<String>) {
    let original = std::mem::take(items);
    extend_unique(items, &original);
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CategoryScores;

    fn image(id: &str, score: f64, elements: &[&str]) -> PerImageResult {
        let mut category_scores = CategoryScores::new();
        category_scores.insert("usability".into(), score);
        PerImageResult {
            subject_id: id.into(),
            category_scores,
            elements: elements.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    fn context_with_ai_metrics() -> GroupContext {
        GroupContext {
            group_id: "g-1".into(),
            thematic_coherence: Some(82.0),
            user_flow_continuity: Some(74.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_scores_are_fully_consistent() {
        let images = vec![image("a", 80.0, &[]), image("b", 80.0, &[]), image("c", 80.0, &[])];
        let aggregate = GroupAggregator::aggregate(&images, &context_with_ai_metrics());
        assert_eq!(aggregate.result.summary.consistency, 100.0);
        assert_eq!(aggregate.result.summary.overall_score, 80.0);
        assert!(!aggregate.is_partial);
    }

    #[test]
    fn test_consistency_uses_population_std_dev() {
        // mean 70, population std-dev 10 → 100 - 20
        let images = vec![image("a", 60.0, &[]), image("b", 80.0, &[])];
        let aggregate = GroupAggregator::aggregate(&images, &context_with_ai_metrics());
        assert_eq!(aggregate.result.summary.consistency, 80.0);
        assert_eq!(aggregate.result.summary.overall_score, 70.0);
    }

    #[test]
    fn test_missing_ai_metrics_are_zero_and_partial() {
        let images = vec![image("a", 60.0, &[])];
        let context = GroupContext {
            group_id: "g-1".into(),
            ..Default::default()
        };
        let aggregate = GroupAggregator::aggregate(&images, &context);
        assert_eq!(aggregate.result.summary.thematic_coherence, 0.0);
        assert_eq!(aggregate.result.summary.user_flow_continuity, 0.0);
        assert!(aggregate.is_partial);
        assert!(aggregate.result.is_partial_result);
    }

    #[test]
    fn test_common_elements_intersection_plus_ai() {
        let images = vec![
            image("a", 70.0, &["Nav Bar", "chart", "footer"]),
            image("b", 70.0, &["nav bar", "footer"]),
        ];
        let mut context = context_with_ai_metrics();
        context.common_elements = vec!["brand colors".into(), "Footer".into()];
        let aggregate = GroupAggregator::aggregate(&images, &context);
        assert_eq!(
            aggregate.result.patterns.common_elements,
            vec!["Nav Bar", "footer", "brand colors"]
        );
    }

    #[test]
    fn test_inconsistencies_and_gaps_are_unions() {
        let mut a = image("a", 70.0, &[]);
        a.inconsistencies = vec!["button radius".into()];
        a.journey_gaps = vec!["no back link".into()];
        let mut b = image("b", 70.0, &[]);
        b.inconsistencies = vec!["Button radius".into(), "font sizes".into()];
        let aggregate = GroupAggregator::aggregate(&[a, b], &context_with_ai_metrics());
        assert_eq!(
            aggregate.result.patterns.design_inconsistencies,
            vec!["button radius", "font sizes"]
        );
        assert_eq!(aggregate.result.patterns.user_journey_gaps, vec!["no back link"]);
    }
}
