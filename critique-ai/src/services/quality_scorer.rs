//! Quality Scorer
//!
//! Turns stage and provider outcomes into an advisory 0-100 quality score and
//! a partial-result flag.
//!
//! # Scoring Algorithm
//! - **Stage credit**: each of the four work stages contributes up to 1.0.
//!   Vision contributes `succeeded / attempted`; with nothing attempted it
//!   contributes 0.5 and the result is partial.
//! - **Base score**: `credit / 4 × 100`
//! - **Dropout penalty**: `provider_dropout_penalty` per failed vision call,
//!   capped at `max_dropout_penalty`
//! - **Confidence penalty**: context and ai confidence below `min_confidence`
//!   each cost up to `confidence_penalty`, proportional to the shortfall
//! - Clamped to 0-100 and rounded

use crate::config::ScoringConfig;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

/// Outcomes gathered from the event log at synthesis time
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageOutcomes {
    /// `None` when the context stage produced nothing
    pub context_confidence: Option<f64>,
    /// The context provider failed and the keyword detector was used
    pub context_degraded: bool,
    pub vision_attempted: usize,
    pub vision_succeeded: usize,
    pub ai_succeeded: bool,
    pub ai_confidence: Option<f64>,
    pub synthesis_succeeded: bool,
}

/// Per-component breakdown, stored in result metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityBreakdown {
    pub stage_credit: f64,
    pub base_score: f64,
    pub dropout_penalty: f64,
    pub confidence_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityScore {
    pub overall_quality: u8,
    pub is_partial_result: bool,
    pub breakdown: QualityBreakdown,
}

const STAGE_COUNT: f64 = 4.0;

pub struct QualityScorer {
    config: ScoringConfig,
}

impl QualityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, outcomes: &StageOutcomes) -> QualityScore {
        let mut partial = false;

        let context_credit = if outcomes.context_confidence.is_some() { 1.0 } else { 0.0 };
        if outcomes.context_confidence.is_none() || outcomes.context_degraded {
            partial = true;
        }

        let vision_credit = if outcomes.vision_attempted == 0 {
            partial = true;
            0.5
        } else {
            if outcomes.vision_succeeded < outcomes.vision_attempted {
                partial = true;
            }
            outcomes.vision_succeeded.min(outcomes.vision_attempted) as f64
                / outcomes.vision_attempted as f64
        };

        let ai_credit = if outcomes.ai_succeeded { 1.0 } else { 0.0 };
        let synthesis_credit = if outcomes.synthesis_succeeded { 1.0 } else { 0.0 };
        if !outcomes.ai_succeeded || !outcomes.synthesis_succeeded {
            partial = true;
        }

        let stage_credit = context_credit + vision_credit + ai_credit + synthesis_credit;
        let base_score = stage_credit / STAGE_COUNT * 100.0;

        let failed_calls = outcomes
            .vision_attempted
            .saturating_sub(outcomes.vision_succeeded) as f64;
        let dropout_penalty =
            (failed_calls * self.config.provider_dropout_penalty).min(self.config.max_dropout_penalty);

        let confidence_penalty = self.confidence_penalty(outcomes.context_confidence)
            + self.confidence_penalty(outcomes.ai_confidence);

        let overall = (base_score - dropout_penalty - confidence_penalty)
            .clamp(0.0, 100.0)
            .round() as u8;

        let breakdown = QualityBreakdown {
            stage_credit,
            base_score,
            dropout_penalty,
            confidence_penalty,
        };

        debug!(
            overall_quality = overall,
            is_partial_result = partial,
            breakdown = %json!(breakdown),
            "Quality score computed"
        );

        QualityScore {
            overall_quality: overall,
            is_partial_result: partial,
            breakdown,
        }
    }

    fn confidence_penalty(&self, confidence: Option<f64>) -> f64 {
        let Some(confidence) = confidence else {
            return 0.0;
        };
        let threshold = self.config.min_confidence;
        if threshold <= 0.0 || confidence >= threshold {
            return 0.0;
        }
        let shortfall = (threshold - confidence.max(0.0)) / threshold;
        shortfall * self.config.confidence_penalty
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_success() -> StageOutcomes {
        StageOutcomes {
            context_confidence: Some(0.9),
            context_degraded: false,
            vision_attempted: 2,
            vision_succeeded: 2,
            ai_succeeded: true,
            ai_confidence: Some(0.9),
            synthesis_succeeded: true,
        }
    }

    #[test]
    fn test_full_success_scores_100() {
        let score = QualityScorer::default().score(&full_success());
        assert_eq!(score.overall_quality, 100);
        assert!(!score.is_partial_result);
    }

    #[test]
    fn test_one_of_two_vision_providers_failed() {
        let outcomes = StageOutcomes {
            vision_succeeded: 1,
            ..full_success()
        };
        let score = QualityScorer::default().score(&outcomes);
        // 3.5 / 4 * 100 = 87.5, minus one 15-point dropout
        assert_eq!(score.overall_quality, 73);
        assert!(score.is_partial_result);
        assert!(score.overall_quality < 100);
    }

    #[test]
    fn test_dropout_penalty_is_capped() {
        let outcomes = StageOutcomes {
            vision_attempted: 6,
            vision_succeeded: 0,
            ..full_success()
        };
        let score = QualityScorer::default().score(&outcomes);
        assert_eq!(score.breakdown.dropout_penalty, 30.0);
        assert_eq!(score.overall_quality, 45);
    }

    #[test]
    fn test_no_vision_attempted_is_half_credit_and_partial() {
        let outcomes = StageOutcomes {
            vision_attempted: 0,
            vision_succeeded: 0,
            ..full_success()
        };
        let score = QualityScorer::default().score(&outcomes);
        assert_eq!(score.breakdown.stage_credit, 3.5);
        assert!(score.is_partial_result);
    }

    #[test]
    fn test_low_confidence_is_penalized_proportionally() {
        let outcomes = StageOutcomes {
            ai_confidence: Some(0.3),
            ..full_success()
        };
        let score = QualityScorer::default().score(&outcomes);
        // Half the threshold → half the 10-point penalty
        assert!((score.breakdown.confidence_penalty - 5.0).abs() < 1e-9);
        assert_eq!(score.overall_quality, 95);
        assert!(!score.is_partial_result);
    }

    #[test]
    fn test_degraded_context_marks_partial() {
        let outcomes = StageOutcomes {
            context_degraded: true,
            ..full_success()
        };
        assert!(QualityScorer::default().score(&outcomes).is_partial_result);
    }
}
