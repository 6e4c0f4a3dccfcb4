//! Batch summaries and processing statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::record::{Outcome, ProcessingRecord};
use crate::schema::FormType;
use crate::submission::{Submission, SubmissionState};

/// One failed document in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub record_id: Uuid,
    pub source: String,
    pub reason: String,
}

/// Aggregate over one batch run. Holds exactly one record per input document,
/// in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub counts: BTreeMap<Outcome, usize>,
    /// Mean confidence over all records, failed ones counting zero
    pub mean_confidence: f64,
    pub form_types: BTreeMap<FormType, usize>,
    pub failures: Vec<BatchFailure>,
    pub records: Vec<ProcessingRecord>,
    /// Submissions made by batch workers when auto-submit is on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submissions: Vec<Submission>,
}

impl BatchSummary {
    pub fn new(
        batch_id: Uuid,
        started_at: DateTime<Utc>,
        records: Vec<ProcessingRecord>,
        submissions: Vec<Submission>,
    ) -> Self {
        let failures = records
            .iter()
            .filter(|r| r.outcome() == Some(Outcome::Failed))
            .map(|r| BatchFailure {
                record_id: r.id(),
                source: r.document().source.name(),
                reason: r
                    .failure()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();

        Self {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            total: records.len(),
            counts: count_outcomes(&records),
            mean_confidence: mean_confidence(&records),
            form_types: count_form_types(&records),
            failures,
            records,
            submissions,
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }
}

/// Store-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatistics {
    pub total_records: usize,
    pub outcomes: BTreeMap<Outcome, usize>,
    pub in_progress: usize,
    pub form_types: BTreeMap<FormType, usize>,
    pub average_confidence: f64,
    pub total_submissions: usize,
    pub submission_states: BTreeMap<SubmissionState, usize>,
}

impl ProcessingStatistics {
    pub fn from_parts(records: &[ProcessingRecord], submissions: &[Submission]) -> Self {
        let mut submission_states = BTreeMap::new();
        for submission in submissions {
            *submission_states.entry(submission.state()).or_insert(0) += 1;
        }
        let terminal: Vec<ProcessingRecord> =
            records.iter().filter(|r| r.is_terminal()).cloned().collect();

        Self {
            total_records: records.len(),
            outcomes: count_outcomes(records),
            in_progress: records.len() - terminal.len(),
            form_types: count_form_types(records),
            average_confidence: mean_confidence(&terminal),
            total_submissions: submissions.len(),
            submission_states,
        }
    }
}

fn count_outcomes(records: &[ProcessingRecord]) -> BTreeMap<Outcome, usize> {
    let mut counts = BTreeMap::new();
    for outcome in records.iter().filter_map(|r| r.outcome()) {
        *counts.entry(outcome).or_insert(0) += 1;
    }
    counts
}

fn count_form_types(records: &[ProcessingRecord]) -> BTreeMap<FormType, usize> {
    let mut counts = BTreeMap::new();
    for form_type in records.iter().filter_map(|r| r.form_type()) {
        *counts.entry(form_type).or_insert(0) += 1;
    }
    counts
}

fn mean_confidence(records: &[ProcessingRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(|r| r.confidence()).sum::<f64>() / records.len() as f64
}
