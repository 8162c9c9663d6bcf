//! Per-capture focus values.

use crate::config::ScoringConfig;
use crate::types::{clamp_confidence, AnalysisResult, FocusState};

/// Turns one analysis result into a focus value on a 0-100 scale.
pub trait FocusScorer: Send + Sync {
    fn score(&self, result: &AnalysisResult) -> f64;
}

/// Maps each focus state to a configured value.
///
/// An analyzer-supplied `focus_score` takes precedence over the mapping. With
/// `confidence_weighted`, the value is pulled toward `neutral` by `1 - confidence`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelScorer {
    config: ScoringConfig,
}

impl LabelScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    fn base_value(&self, state: FocusState) -> f64 {
        match state {
            FocusState::Focused => self.config.focused,
            FocusState::Neutral => self.config.neutral,
            FocusState::Scattered => self.config.scattered,
        }
    }
}

impl Default for LabelScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl FocusScorer for LabelScorer {
    fn score(&self, result: &AnalysisResult) -> f64 {
        let base = result
            .focus_score
            .filter(|s| s.is_finite())
            .unwrap_or_else(|| self.base_value(result.focus_state));

        let value = if self.config.confidence_weighted {
            let neutral = self.config.neutral;
            neutral + (base - neutral) * clamp_confidence(result.confidence)
        } else {
            base
        };

        value.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn result(state: FocusState, confidence: f64, focus_score: Option<f64>) -> AnalysisResult {
        AnalysisResult {
            capture_id: Uuid::new_v4(),
            captured_at: Utc::now(),
            activity_label: "coding".to_string(),
            focus_state: state,
            detected_context: String::new(),
            confidence,
            focus_score,
            duplicate: false,
        }
    }

    #[test]
    fn test_default_mapping() {
        let scorer = LabelScorer::default();
        assert_eq!(scorer.score(&result(FocusState::Focused, 0.3, None)), 100.0);
        assert_eq!(scorer.score(&result(FocusState::Neutral, 1.0, None)), 50.0);
        assert_eq!(scorer.score(&result(FocusState::Scattered, 1.0, None)), 0.0);
    }

    #[test]
    fn test_confidence_weighting_pulls_toward_neutral() {
        let scorer = LabelScorer::new(ScoringConfig {
            confidence_weighted: true,
            ..Default::default()
        });
        assert_eq!(scorer.score(&result(FocusState::Focused, 0.5, None)), 75.0);
        assert_eq!(scorer.score(&result(FocusState::Scattered, 0.5, None)), 25.0);
        assert_eq!(scorer.score(&result(FocusState::Focused, 0.0, None)), 50.0);
    }

    #[test]
    fn test_non_finite_confidence_counts_as_full() {
        let scorer = LabelScorer::new(ScoringConfig {
            confidence_weighted: true,
            ..Default::default()
        });
        let score = scorer.score(&result(FocusState::Focused, f64::NAN, None));
        assert_eq!(score, 100.0);
        let score = scorer.score(&result(FocusState::Scattered, f64::NEG_INFINITY, None));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_supplied_score_overrides_and_is_clamped() {
        let scorer = LabelScorer::default();
        assert_eq!(scorer.score(&result(FocusState::Scattered, 1.0, Some(82.0))), 82.0);
        assert_eq!(scorer.score(&result(FocusState::Focused, 1.0, Some(140.0))), 100.0);
        assert_eq!(scorer.score(&result(FocusState::Focused, 1.0, Some(-3.0))), 0.0);
        assert_eq!(scorer.score(&result(FocusState::Neutral, 1.0, Some(f64::NAN))), 50.0);
    }
}
