//! Confidence Scorer
//!
//! Folds recognition quality, required-field coverage and the validation
//! verdict into one trust score in [0, 1]. Weights are configuration, checked
//! to sum to 1.0 by [`ScoringWeights::validate`].

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::recognition::{weighted_confidence, RecognizedBlock};
use crate::resolver::ResolvedField;
use crate::schema::FormSchema;
use crate::validator::Verdict;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub recognition: f64,
    pub resolution: f64,
    pub validation: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recognition: 0.2,
            resolution: 0.3,
            validation: 0.5,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            ("recognition", self.recognition),
            ("resolution", self.resolution),
            ("validation", self.validation),
        ];
        if let Some((name, w)) = weights.iter().find(|(_, w)| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "scoring weight '{}' must be a non-negative number, got {}",
                name, w
            )));
        }
        let sum: f64 = weights.iter().map(|(_, w)| w).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "scoring weights must sum to 1.0, got {:.6}",
                sum
            )));
        }
        Ok(())
    }
}

/// Scorer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Validation sub-score for `valid_with_warnings`
    pub warnings_score: f64,
    /// Fraction of a field's confidence lost when it was bound ambiguously
    pub ambiguity_penalty: f64,
    /// Scores at or above this count as high confidence
    pub high_confidence_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            warnings_score: 0.6,
            ambiguity_penalty: 0.2,
            high_confidence_threshold: 0.85,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        for (name, value) in [
            ("warnings_score", self.warnings_score),
            ("ambiguity_penalty", self.ambiguity_penalty),
            ("high_confidence_threshold", self.high_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "scoring.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Sub-scores and the combined score, kept on the record for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub recognition: f64,
    pub resolution: f64,
    pub validation: f64,
    pub overall: f64,
}

impl ScoreBreakdown {
    pub fn zero() -> Self {
        Self {
            recognition: 0.0,
            resolution: 0.0,
            validation: 0.0,
            overall: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    config: ScoringConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn recognition_score(&self, blocks: &[RecognizedBlock]) -> f64 {
        weighted_confidence(blocks)
    }

    /// Mean confidence of required fields, unresolved counting zero and
    /// ambiguous binds reduced by the ambiguity penalty
    pub fn resolution_score(&self, schema: &FormSchema, fields: &[ResolvedField]) -> f64 {
        let required: Vec<&str> = schema.required_fields().map(|f| f.name.as_str()).collect();
        if required.is_empty() {
            return 1.0;
        }
        let total: f64 = required
            .iter()
            .filter_map(|name| fields.iter().find(|f| f.name == *name))
            .filter(|f| f.is_resolved())
            .map(|f| {
                let penalty = if f.ambiguous {
                    1.0 - self.config.ambiguity_penalty
                } else {
                    1.0
                };
                f.confidence.clamp(0.0, 1.0) * penalty
            })
            .sum();
        total / required.len() as f64
    }

    pub fn validation_score(&self, verdict: Verdict) -> f64 {
        match verdict {
            Verdict::Valid => 1.0,
            Verdict::ValidWithWarnings => self.config.warnings_score,
            Verdict::Invalid => 0.0,
        }
    }

    /// Weighted sum of sub-scores. An invalid verdict scores zero overall.
    pub fn combine(&self, recognition: f64, resolution: f64, verdict: Verdict) -> ScoreBreakdown {
        let validation = self.validation_score(verdict);
        let w = &self.config.weights;
        let overall = if verdict == Verdict::Invalid {
            0.0
        } else {
            (w.recognition * recognition + w.resolution * resolution + w.validation * validation)
                .clamp(0.0, 1.0)
        };
        ScoreBreakdown {
            recognition,
            resolution,
            validation,
            overall,
        }
    }

    pub fn score(
        &self,
        blocks: &[RecognizedBlock],
        schema: &FormSchema,
        fields: &[ResolvedField],
        verdict: Verdict,
    ) -> ScoreBreakdown {
        let breakdown = self.combine(
            self.recognition_score(blocks),
            self.resolution_score(schema, fields),
            verdict,
        );
        tracing::debug!(
            recognition = breakdown.recognition,
            resolution = breakdown.resolution,
            validation = breakdown.validation,
            overall = breakdown.overall,
            "Scored record"
        );
        breakdown
    }

    pub fn is_high_confidence(&self, breakdown: &ScoreBreakdown) -> bool {
        breakdown.overall >= self.config.high_confidence_threshold
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntitySpan, EntityType};
    use proptest::prelude::*;

    fn field(name: &str, confidence: f64, ambiguous: bool) -> ResolvedField {
        ResolvedField {
            name: name.to_string(),
            value: Some(EntitySpan::new(EntityType::Amount, "1", confidence, 0, 1)),
            confidence,
            ambiguous,
            candidate_count: if ambiguous { 2 } else { 1 },
            decided_by: None,
        }
    }

    #[test]
    fn test_default_weights_are_valid() {
        assert!(ScoringConfig::default().validate().is_ok());
        let w = ScoringWeights::default();
        assert!(w.validation > w.resolution && w.validation > w.recognition);
    }

    #[test]
    fn test_rejects_bad_weights() {
        let uneven = ScoringWeights {
            recognition: 0.5,
            resolution: 0.5,
            validation: 0.5,
        };
        assert!(uneven.validate().is_err());

        let negative = ScoringWeights {
            recognition: -0.2,
            resolution: 0.7,
            validation: 0.5,
        };
        assert!(negative.validate().is_err());

        let mut config = ScoringConfig::default();
        config.warnings_score = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolution_score_penalizes_gaps_and_ambiguity() {
        let scorer = ConfidenceScorer::default();
        let schema = FormSchema::w2();
        let fields = vec![
            field("employee_name", 1.0, false),
            field("employee_ssn", 1.0, true),
            ResolvedField::unresolved("employer_ein"),
            field("wages", 0.5, false),
            field("state_wages", 1.0, false),
        ];
        // (1.0 + 0.8 + 0.0 + 0.5) / 4
        let score = scorer.resolution_score(&schema, &fields);
        assert!((score - 0.575).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_scores_zero() {
        let breakdown = ConfidenceScorer::default().combine(1.0, 1.0, Verdict::Invalid);
        assert_eq!(breakdown.overall, 0.0);
        assert_eq!(breakdown.recognition, 1.0);
    }

    #[test]
    fn test_perfect_valid_scores_one() {
        let scorer = ConfidenceScorer::default();
        let breakdown = scorer.combine(1.0, 1.0, Verdict::Valid);
        assert!((breakdown.overall - 1.0).abs() < 1e-9);
        assert!(scorer.is_high_confidence(&breakdown));
    }

    fn weights() -> impl Strategy<Value = ScoringWeights> {
        (0.0f64..1.0, 0.0f64..1.0).prop_map(|(a, b)| {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            ScoringWeights {
                recognition: lo,
                resolution: hi - lo,
                validation: 1.0 - hi,
            }
        })
    }

    proptest! {
        #[test]
        fn test_score_monotonic_in_verdict(
            recognition in 0.0f64..=1.0,
            resolution in 0.0f64..=1.0,
            warnings_score in 0.0f64..=1.0,
            weights in weights(),
        ) {
            let scorer = ConfidenceScorer::new(ScoringConfig {
                weights,
                warnings_score,
                ..ScoringConfig::default()
            });
            let valid = scorer.combine(recognition, resolution, Verdict::Valid).overall;
            let warned = scorer.combine(recognition, resolution, Verdict::ValidWithWarnings).overall;
            let invalid = scorer.combine(recognition, resolution, Verdict::Invalid).overall;

            prop_assert!(valid >= warned);
            prop_assert!(warned >= invalid);
            prop_assert_eq!(invalid, 0.0);
            prop_assert!((0.0..=1.0).contains(&valid));
        }

        #[test]
        fn test_generated_weights_validate(weights in weights()) {
            prop_assert!(weights.validate().is_ok());
        }

        #[test]
        fn test_scaled_weights_fail_validation(weights in weights(), factor in 1.01f64..3.0) {
            let scaled = ScoringWeights {
                recognition: weights.recognition * factor,
                resolution: weights.resolution * factor,
                validation: weights.validation * factor,
            };
            prop_assert!(scaled.validate().is_err());
        }
    }
}
