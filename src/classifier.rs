//! Form Classifier
//!
//! Scores every registered schema by weighted signature-phrase occurrences in
//! the recognized text and picks one. Phrases match on word boundaries, so
//! "payer" does not count inside "taxpayer". A caller hint wins when it scores within
//! `hint_tolerance` of the best. Equal best scores go to the schema with the
//! most required fields already resolvable from the extracted entities, then
//! to registry order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::EntitySpan;
use crate::resolver::candidates;
use crate::schema::{FormSchema, FormType, SchemaRegistry};

/// Scores closer than this are treated as equal
const SCORE_EPSILON: f64 = 1e-9;

/// Classifier tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Every schema scoring below this is a `NoSchemaMatch`
    pub min_score: f64,
    /// How far below the best score a hinted schema may fall and still win
    pub hint_tolerance: f64,
    /// Occurrences of one phrase counted at most this many times
    pub occurrence_cap: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_score: 2.0,
            hint_tolerance: 1.0,
            occurrence_cap: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassificationError {
    #[error("No form schema matched: best score {best_score:.2} is below {threshold:.2}")]
    NoSchemaMatch { best_score: f64, threshold: f64 },
}

/// Which rule picked the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationBasis {
    /// Single highest score
    BestScore,
    /// Caller hint within tolerance of the best score
    Hint,
    /// Tied best score, decided by resolvable required fields or registry order
    TieBreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaScore {
    pub form_type: FormType,
    pub score: f64,
}

/// Classifier output, kept on the processing record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub form_type: FormType,
    pub score: f64,
    pub basis: ClassificationBasis,
    /// Score of every registered schema, in registry order
    pub scores: Vec<SchemaScore>,
}

#[derive(Debug, Clone)]
pub struct FormClassifier {
    registry: Arc<SchemaRegistry>,
    config: ClassifierConfig,
    /// Compiled pattern per lower-cased registry phrase
    patterns: HashMap<String, Regex>,
}

impl FormClassifier {
    pub fn new(registry: Arc<SchemaRegistry>, config: ClassifierConfig) -> Self {
        let mut patterns = HashMap::new();
        for sig in registry.iter().flat_map(|schema| schema.signatures.iter()) {
            let phrase = sig.phrase.to_lowercase();
            if patterns.contains_key(&phrase) {
                continue;
            }
            if let Some(pattern) = phrase_pattern(&phrase) {
                patterns.insert(phrase, pattern);
            }
        }
        Self {
            registry,
            config,
            patterns,
        }
    }

    fn count_phrase(&self, phrase: &str, text_lower: &str) -> usize {
        match self.patterns.get(phrase) {
            Some(pattern) => pattern.find_iter(text_lower).count(),
            None => phrase_pattern(phrase).map_or(0, |p| p.find_iter(text_lower).count()),
        }
    }

    /// Weighted, capped count of signature phrases in already lower-cased text
    pub fn score_schema(&self, schema: &FormSchema, text_lower: &str) -> f64 {
        schema
            .signatures
            .iter()
            .map(|sig| {
                let phrase = sig.phrase.to_lowercase();
                if phrase.is_empty() {
                    return 0.0;
                }
                let hits = self.count_phrase(&phrase, text_lower);
                sig.weight * hits.min(self.config.occurrence_cap) as f64
            })
            .sum()
    }

    pub fn scores(&self, text: &str) -> Vec<SchemaScore> {
        let lower = text.to_lowercase();
        self.registry
            .iter()
            .map(|schema| SchemaScore {
                form_type: schema.form_type,
                score: self.score_schema(schema, &lower),
            })
            .collect()
    }

    pub fn classify(
        &self,
        text: &str,
        hint: Option<FormType>,
        spans: &[EntitySpan],
    ) -> Result<Classification, ClassificationError> {
        let scores = self.scores(text);
        let best = scores.iter().map(|s| s.score).fold(0.0, f64::max);

        if best < self.config.min_score {
            tracing::debug!(best_score = best, "No schema above classification threshold");
            return Err(ClassificationError::NoSchemaMatch {
                best_score: best,
                threshold: self.config.min_score,
            });
        }

        if let Some(hinted) = hint.and_then(|h| scores.iter().find(|s| s.form_type == h)) {
            if hinted.score >= self.config.min_score
                && best - hinted.score <= self.config.hint_tolerance + SCORE_EPSILON
            {
                tracing::debug!(form_type = %hinted.form_type, score = hinted.score, "Classified by hint");
                return Ok(Classification {
                    form_type: hinted.form_type,
                    score: hinted.score,
                    basis: ClassificationBasis::Hint,
                    scores,
                });
            }
        }

        let tied: Vec<&SchemaScore> = scores
            .iter()
            .filter(|s| best - s.score <= SCORE_EPSILON)
            .collect();

        let (chosen, basis) = if tied.len() == 1 {
            (tied[0].form_type, ClassificationBasis::BestScore)
        } else {
            // max_by_key keeps the last maximum, so walk in reverse to keep registry order
            let chosen = tied
                .iter()
                .rev()
                .max_by_key(|s| self.resolvable_required(s.form_type, spans))
                .map(|s| s.form_type)
                .unwrap_or(tied[0].form_type);
            (chosen, ClassificationBasis::TieBreak)
        };

        tracing::debug!(form_type = %chosen, score = best, ?basis, "Classified document");
        Ok(Classification {
            form_type: chosen,
            score: best,
            basis,
            scores,
        })
    }

    /// Required fields of a schema that have at least one candidate span
    fn resolvable_required(&self, form_type: FormType, spans: &[EntitySpan]) -> usize {
        self.registry
            .get(form_type)
            .map(|schema| {
                schema
                    .required_fields()
                    .filter(|field| !candidates(field, spans).is_empty())
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Phrase anchored at word boundaries on its word-character edges
fn phrase_pattern(phrase: &str) -> Option<Regex> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let start = if phrase.starts_with(is_word) { r"\b" } else { "" };
    let end = if phrase.ends_with(is_word) { r"\b" } else { "" };
    Regex::new(&format!("{}{}{}", start, regex::escape(phrase), end)).ok()
}
