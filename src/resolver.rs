//! Field Resolver
//!
//! Binds entity spans to the fields of the chosen schema. A span is a
//! candidate for a field when its entity type matches and, for anchored
//! fields, its label starts with one of the anchors.
//!
//! Resolution runs in two passes. Fields with zero or one candidate bind
//! first. Fields with several candidates then resolve in schema order through
//! an ordered [`TieBreakRule`] list, so proximity can use every block already
//! bound. Multi-candidate binds are always flagged `ambiguous`.

use serde::{Deserialize, Serialize};

use crate::entity::{label_matches, EntitySpan};
use crate::recognition::BlockRef;
use crate::schema::{FieldDefinition, FormSchema};

const CONFIDENCE_EPSILON: f64 = 1e-9;

/// One rule in the ranked tie-break policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    /// Keep the candidates with the highest extraction confidence
    HighestConfidence,
    /// Keep the candidates spatially closest to blocks of already-resolved fields
    NearestResolvedBlock,
    /// Keep the first candidate in reading order
    ReadingOrder,
}

impl TieBreakRule {
    pub const DEFAULT_ORDER: [TieBreakRule; 3] = [
        TieBreakRule::HighestConfidence,
        TieBreakRule::NearestResolvedBlock,
        TieBreakRule::ReadingOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighestConfidence => "highest_confidence",
            Self::NearestResolvedBlock => "nearest_resolved_block",
            Self::ReadingOrder => "reading_order",
        }
    }

    /// Narrow the candidate set. Never returns an empty set for non-empty input.
    pub fn narrow<'a>(
        &self,
        candidates: Vec<&'a EntitySpan>,
        resolved_blocks: &[BlockRef],
    ) -> Vec<&'a EntitySpan> {
        match self {
            Self::HighestConfidence => {
                let best = candidates
                    .iter()
                    .map(|c| c.confidence)
                    .fold(f64::NEG_INFINITY, f64::max);
                candidates
                    .into_iter()
                    .filter(|c| best - c.confidence <= CONFIDENCE_EPSILON)
                    .collect()
            }
            Self::NearestResolvedBlock => {
                let distance = |c: &EntitySpan| -> f64 {
                    c.source_block
                        .map(|block| {
                            resolved_blocks
                                .iter()
                                .map(|other| block.distance(other))
                                .fold(f64::INFINITY, f64::min)
                        })
                        .unwrap_or(f64::INFINITY)
                };
                let best = candidates
                    .iter()
                    .map(|c| distance(*c))
                    .fold(f64::INFINITY, f64::min);
                if best.is_infinite() {
                    return candidates;
                }
                candidates
                    .into_iter()
                    .filter(|c| distance(*c) - best <= CONFIDENCE_EPSILON)
                    .collect()
            }
            Self::ReadingOrder => candidates
                .into_iter()
                .min_by_key(|c| (c.start, c.end))
                .into_iter()
                .collect(),
        }
    }
}

impl std::fmt::Display for TieBreakRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A schema field bound to zero or one span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub name: String,
    pub value: Option<EntitySpan>,
    /// Confidence of the bound span, zero when unresolved
    pub confidence: f64,
    /// More than one plausible candidate existed
    pub ambiguous: bool,
    pub candidate_count: usize,
    /// Rule that reduced the candidates to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<TieBreakRule>,
}

impl ResolvedField {
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            confidence: 0.0,
            ambiguous: false,
            candidate_count: 0,
            decided_by: None,
        }
    }

    fn bound(name: &str, span: &EntitySpan, candidate_count: usize) -> Self {
        Self {
            name: name.to_string(),
            value: Some(span.clone()),
            confidence: span.confidence,
            ambiguous: candidate_count > 1,
            candidate_count,
            decided_by: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    pub fn value_str(&self) -> Option<&str> {
        self.value.as_ref().map(|v| v.value.as_str())
    }
}

/// Spans that may fill a field, in reading order
pub fn candidates<'a>(field: &FieldDefinition, spans: &'a [EntitySpan]) -> Vec<&'a EntitySpan> {
    spans
        .iter()
        .filter(|span| span.entity_type == field.entity_type)
        .filter(|span| {
            if field.anchors.is_empty() {
                return true;
            }
            span.normalized_label().is_some_and(|label| {
                field
                    .anchors
                    .iter()
                    .any(|anchor| label_matches(&label, anchor))
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FieldResolver {
    rules: Vec<TieBreakRule>,
}

impl FieldResolver {
    pub fn new() -> Self {
        Self {
            rules: TieBreakRule::DEFAULT_ORDER.to_vec(),
        }
    }

    /// Use a custom rule order. Reading order is always the implicit last resort.
    pub fn with_rules(rules: Vec<TieBreakRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TieBreakRule] {
        &self.rules
    }

    /// One entry per schema field, in schema order. Never fails.
    pub fn resolve(&self, schema: &FormSchema, spans: &[EntitySpan]) -> Vec<ResolvedField> {
        let per_field: Vec<Vec<&EntitySpan>> = schema
            .fields
            .iter()
            .map(|field| candidates(field, spans))
            .collect();

        let mut resolved: Vec<Option<ResolvedField>> = vec![None; schema.fields.len()];
        let mut anchors: Vec<BlockRef> = Vec::new();

        for (i, field) in schema.fields.iter().enumerate() {
            match per_field[i].as_slice() {
                [] => resolved[i] = Some(ResolvedField::unresolved(&field.name)),
                [only] => {
                    anchors.extend(only.source_block);
                    resolved[i] = Some(ResolvedField::bound(&field.name, only, 1));
                }
                _ => {}
            }
        }

        for (i, field) in schema.fields.iter().enumerate() {
            if resolved[i].is_some() {
                continue;
            }
            let pool = per_field[i].clone();
            let count = pool.len();
            let (chosen, decided_by) = self.break_tie(pool, &anchors);
            let mut entry = match chosen {
                Some(span) => {
                    anchors.extend(span.source_block);
                    ResolvedField::bound(&field.name, span, count)
                }
                None => ResolvedField::unresolved(&field.name),
            };
            entry.decided_by = decided_by;
            tracing::trace!(
                field = %field.name,
                candidates = count,
                decided_by = ?decided_by,
                "Resolved ambiguous field"
            );
            resolved[i] = Some(entry);
        }

        resolved
            .into_iter()
            .zip(&schema.fields)
            .map(|(entry, field)| entry.unwrap_or_else(|| ResolvedField::unresolved(&field.name)))
            .collect()
    }

    fn break_tie<'a>(
        &self,
        mut pool: Vec<&'a EntitySpan>,
        anchors: &[BlockRef],
    ) -> (Option<&'a EntitySpan>, Option<TieBreakRule>) {
        for rule in &self.rules {
            pool = rule.narrow(pool, anchors);
            if pool.len() <= 1 {
                return (pool.first().copied(), Some(*rule));
            }
        }
        let last = TieBreakRule::ReadingOrder;
        pool = last.narrow(pool, anchors);
        (pool.first().copied(), Some(last))
    }
}

impl Default for FieldResolver {
    fn default() -> Self {
        Self::new()
    }
}
