//! Entity Extractor
//!
//! Boundary to the external entity-recognition service, plus a deterministic
//! pattern-based extractor for tax identifiers, amounts, dates, filing status
//! and names written as `Label: value` lines.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;

use crate::recognition::{BlockRef, TextLayer};

/// Entity labels the extractor can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Person or organization name
    Name,
    Ssn,
    Ein,
    Amount,
    Date,
    TaxYear,
    ZipCode,
    FilingStatus,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Ssn => "ssn",
            Self::Ein => "ein",
            Self::Amount => "amount",
            Self::Date => "date",
            Self::TaxYear => "tax_year",
            Self::ZipCode => "zip_code",
            Self::FilingStatus => "filing_status",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "ssn" => Ok(Self::Ssn),
            "ein" => Ok(Self::Ein),
            "amount" => Ok(Self::Amount),
            "date" => Ok(Self::Date),
            "tax_year" => Ok(Self::TaxYear),
            "zip_code" => Ok(Self::ZipCode),
            "filing_status" => Ok(Self::FilingStatus),
            _ => Err(format!("Unknown entity type: {}", s)),
        }
    }
}

/// A tagged substring of the recognized text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub entity_type: EntityType,
    pub value: String,
    /// Extraction confidence in [0, 1]
    pub confidence: f64,
    /// Byte offsets into the concatenated text
    pub start: usize,
    pub end: usize,
    /// Caption the value was written under (`Wages` in `Wages: $10`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_block: Option<BlockRef>,
}

impl EntitySpan {
    pub fn new(
        entity_type: EntityType,
        value: impl Into<String>,
        confidence: f64,
        start: usize,
        end: usize,
    ) -> Self {
        Self {
            entity_type,
            value: value.into(),
            confidence,
            start,
            end,
            label: None,
            source_block: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_block(mut self, block: BlockRef) -> Self {
        self.source_block = Some(block);
        self
    }

    /// Label normalized for anchor comparison, see [`normalize_label`]
    pub fn normalized_label(&self) -> Option<String> {
        self.label.as_deref().map(normalize_label)
    }
}

/// Lowercase, drop apostrophes, turn punctuation into spaces and strip leading
/// box/line numbering (`Box 1`, `1a`, `Line 9`).
pub fn normalize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .filter(|c| *c != '\'' && *c != '\u{2019}')
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .skip_while(|tok| {
            *tok == "box" || *tok == "line" || tok.starts_with(|c: char| c.is_ascii_digit())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the normalized label begins with the normalized anchor on a word boundary
pub fn label_matches(label: &str, anchor: &str) -> bool {
    let anchor = normalize_label(anchor);
    if anchor.is_empty() {
        return false;
    }
    label == anchor
        || label
            .strip_prefix(anchor.as_str())
            .is_some_and(|rest| rest.starts_with(' '))
}

/// Fill in `source_block` for spans that do not carry one yet
pub fn attach_blocks(spans: &mut [EntitySpan], layer: &TextLayer) {
    for span in spans.iter_mut().filter(|s| s.source_block.is_none()) {
        span.source_block = layer.block_at(span.start);
    }
}

/// External entity-recognition boundary.
///
/// Never fails on UTF-8 input and must be deterministic for identical text.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Vec<EntitySpan>;

    /// Model name recorded on the processing record
    fn model_name(&self) -> &'static str;
}

static LABELLED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^:]{1,80}?)\s*:\s*(.*?)\s*$").expect("valid regex"));
static SSN_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{3}-\d{2}-\d{4}$").expect("valid regex"));
static EIN_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}-\d{7}$").expect("valid regex"));
static DATE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d{1,2}[/-]\d{1,2}[/-]\d{4}|\d{4}-\d{2}-\d{2})$").expect("valid regex")
});
static YEAR_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:19|20)\d{2}$").expect("valid regex"));
static ZIP_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{5}(?:-\d{4})?$").expect("valid regex"));
static AMOUNT_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?\$?\s?-?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{1,2})?$").expect("valid regex")
});
static FILING_STATUS_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:single|married filing jointly|married filing separately|head of household|qualifying widow(?:\(er\))?|qualifying surviving spouse)$",
    )
    .expect("valid regex")
});
static NAME_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z.,'&\- ]{0,78}[A-Za-z.]$").expect("valid regex"));

static SSN_FREE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid regex"));
static EIN_FREE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{2}-\d{7}\b").expect("valid regex"));
static DATE_FREE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,2}[/-]\d{1,2}[/-]\d{4}|\d{4}-\d{2}-\d{2})\b").expect("valid regex")
});
static AMOUNT_FREE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{2})?").expect("valid regex")
});

/// Longest name value accepted, in words
const MAX_NAME_WORDS: usize = 8;

/// Regex extractor over `Label: value` lines and free text.
///
/// Labelled values outrank free-text matches; overlapping spans are merged
/// keeping the most confident one.
#[derive(Debug, Clone, Default)]
pub struct PatternEntityExtractor;

impl PatternEntityExtractor {
    pub fn new() -> Self {
        Self
    }

    fn classify_labelled(label: &str, value: &str) -> Option<(EntityType, f64)> {
        let label_lower = label.to_lowercase();
        if label_lower.contains("year") && YEAR_VALUE.is_match(value) {
            return Some((EntityType::TaxYear, 0.92));
        }
        if SSN_VALUE.is_match(value) {
            return Some((EntityType::Ssn, 0.97));
        }
        if EIN_VALUE.is_match(value) {
            return Some((EntityType::Ein, 0.97));
        }
        if DATE_VALUE.is_match(value) {
            return Some((EntityType::Date, 0.93));
        }
        if FILING_STATUS_VALUE.is_match(value) {
            return Some((EntityType::FilingStatus, 0.9));
        }
        if label_lower.contains("zip") && ZIP_VALUE.is_match(value) {
            return Some((EntityType::ZipCode, 0.9));
        }
        if AMOUNT_VALUE.is_match(value) {
            return Some((EntityType::Amount, 0.95));
        }
        if NAME_VALUE.is_match(value) && value.split_whitespace().count() <= MAX_NAME_WORDS {
            return Some((EntityType::Name, 0.85));
        }
        None
    }

    fn extract_line(line: &str, offset: usize, out: &mut Vec<EntitySpan>) {
        if let Some(caps) = LABELLED_LINE.captures(line) {
            if let (Some(label), Some(value)) = (caps.get(1), caps.get(2)) {
                let label_text = label.as_str().trim();
                if !value.as_str().is_empty() && !label_text.is_empty() {
                    if let Some((entity_type, confidence)) =
                        Self::classify_labelled(label_text, value.as_str())
                    {
                        out.push(
                            EntitySpan::new(
                                entity_type,
                                value.as_str(),
                                confidence,
                                offset + value.start(),
                                offset + value.end(),
                            )
                            .with_label(label_text),
                        );
                    }
                }
            }
        }

        let free: [(&Regex, EntityType, f64); 4] = [
            (&SSN_FREE, EntityType::Ssn, 0.8),
            (&EIN_FREE, EntityType::Ein, 0.8),
            (&DATE_FREE, EntityType::Date, 0.75),
            (&AMOUNT_FREE, EntityType::Amount, 0.7),
        ];
        for (pattern, entity_type, confidence) in free {
            for m in pattern.find_iter(line) {
                out.push(EntitySpan::new(
                    entity_type,
                    m.as_str(),
                    confidence,
                    offset + m.start(),
                    offset + m.end(),
                ));
            }
        }
    }
}

#[async_trait]
impl EntityExtractor for PatternEntityExtractor {
    async fn extract(&self, text: &str) -> Vec<EntitySpan> {
        let mut spans = Vec::new();
        let mut offset = 0;
        for line in text.split('\n') {
            Self::extract_line(line, offset, &mut spans);
            offset += line.len() + 1;
        }
        merge_overlapping(spans)
    }

    fn model_name(&self) -> &'static str {
        "pattern"
    }
}

/// Collapse overlapping spans, keeping the most confident of each cluster.
/// Equal confidence keeps the earlier span.
pub fn merge_overlapping(mut spans: Vec<EntitySpan>) -> Vec<EntitySpan> {
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut merged: Vec<EntitySpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(current) if span.start < current.end => {
                if span.confidence > current.confidence {
                    *current = span;
                }
            }
            _ => merged.push(span),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn extract(text: &str) -> Vec<EntitySpan> {
        PatternEntityExtractor::new().extract(text).await
    }

    #[test]
    fn test_normalize_label_strips_numbering() {
        assert_eq!(
            normalize_label("1 Wages, tips, other compensation"),
            "wages tips other compensation"
        );
        assert_eq!(
            normalize_label("Box 2 Federal income tax withheld"),
            "federal income tax withheld"
        );
        assert_eq!(
            normalize_label("Employee's social security number"),
            "employees social security number"
        );
        assert_eq!(normalize_label("9b"), "");
    }

    #[test]
    fn test_label_matches_word_boundary() {
        let label = normalize_label("Wages, tips, other compensation");
        assert!(label_matches(&label, "wages"));
        assert!(!label_matches(&label, "wage"));
        assert!(!label_matches(&normalize_label("State wages"), "wages"));
        assert!(label_matches(&normalize_label("Total income"), "Total income"));
    }

    #[tokio::test]
    async fn test_labelled_values_are_typed() {
        let spans = extract(
            "Employee's social security number: 987-65-4321\n\
             Employer identification number: 12-3456789\n\
             Wages, tips, other compensation: $52,000.00\n\
             Employee name: Jane Q Public\n\
             Filing status: Married filing jointly\n\
             Tax year: 2023\n\
             Date of birth: 04/12/1980\n\
             ZIP code: 02139",
        )
        .await;

        let types: Vec<EntityType> = spans.iter().map(|s| s.entity_type).collect();
        assert_eq!(
            types,
            vec![
                EntityType::Ssn,
                EntityType::Ein,
                EntityType::Amount,
                EntityType::Name,
                EntityType::FilingStatus,
                EntityType::TaxYear,
                EntityType::Date,
                EntityType::ZipCode,
            ]
        );
        assert_eq!(spans[2].value, "$52,000.00");
        assert_eq!(spans[2].label.as_deref(), Some("Wages, tips, other compensation"));
        assert_eq!(spans[0].confidence, 0.97);
    }

    #[tokio::test]
    async fn test_offsets_point_into_text() {
        let text = "Form W-2\nWages: $1,200.50";
        let spans = extract(text).await;
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].start..spans[0].end], "$1,200.50");
    }

    #[tokio::test]
    async fn test_free_text_matches_have_no_label() {
        let spans = extract("paid $300 to 12-3456789 on 2024-01-15").await;
        let types: Vec<EntityType> = spans.iter().map(|s| s.entity_type).collect();
        assert_eq!(
            types,
            vec![EntityType::Amount, EntityType::Ein, EntityType::Date]
        );
        assert!(spans.iter().all(|s| s.label.is_none()));
    }

    #[tokio::test]
    async fn test_extraction_is_deterministic() {
        let text = "SSN: 987-65-4321\nTotal income: $86,200";
        assert_eq!(extract(text).await, extract(text).await);
    }

    #[test]
    fn test_merge_keeps_most_confident() {
        let spans = vec![
            EntitySpan::new(EntityType::Amount, "$10", 0.7, 5, 8),
            EntitySpan::new(EntityType::Amount, "$10", 0.95, 5, 8).with_label("Wages"),
            EntitySpan::new(EntityType::Date, "x", 0.5, 20, 21),
        ];
        let merged = merge_overlapping(spans);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].confidence, 0.95);
        assert_eq!(merged[0].label.as_deref(), Some("Wages"));
    }
}
