//! Processing Record
//!
//! Aggregate root for one document's run through the pipeline. Stage results
//! are attached as the record advances through [`PipelineState`]; every
//! transition is forward-only and recorded in the history. Once terminal the
//! record no longer changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::classifier::Classification;
use crate::document::DocumentRef;
use crate::entity::EntitySpan;
use crate::recognition::RecognitionSummary;
use crate::resolver::ResolvedField;
use crate::schema::{FormSchema, FormType};
use crate::scoring::ScoreBreakdown;
use crate::validator::{ValidationResult, Verdict};

/// Terminal result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    /// Success and partial records may be submitted
    pub fn is_submittable(&self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }

    pub fn from_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Valid => Self::Success,
            Verdict::ValidWithWarnings => Self::Partial,
            Verdict::Invalid => Self::Failed,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown outcome: {}", s)),
        }
    }
}

/// Pipeline stage a record has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Ingested,
    Recognized,
    Classified,
    Resolved,
    Validated,
    Scored,
    Terminal(Outcome),
}

impl PipelineState {
    fn rank(&self) -> u8 {
        match self {
            Self::Ingested => 0,
            Self::Recognized => 1,
            Self::Classified => 2,
            Self::Resolved => 3,
            Self::Validated => 4,
            Self::Scored => 5,
            Self::Terminal(_) => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// One step forward, or straight to `Terminal(Failed)` from any live state.
    /// Success and partial are only reachable from `Scored`.
    pub fn can_transition_to(&self, next: &PipelineState) -> bool {
        match (self, next) {
            (Self::Terminal(_), _) => false,
            (_, Self::Terminal(Outcome::Failed)) => true,
            (Self::Scored, Self::Terminal(_)) => true,
            (_, Self::Terminal(_)) => false,
            (from, to) => to.rank() == from.rank() + 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::Recognized => "recognized",
            Self::Classified => "classified",
            Self::Resolved => "resolved",
            Self::Validated => "validated",
            Self::Scored => "scored",
            Self::Terminal(_) => "terminal",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal(outcome) => write!(f, "terminal({})", outcome),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Why a record ended `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    RecognitionError { message: String },
    NoSchemaMatch { best_score: f64 },
    StageTimeout { stage: String, timeout_ms: u64 },
    ValidationFailed { errors: usize },
    /// The batch was abandoned before this document started
    Cancelled,
    Internal { message: String },
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RecognitionError { .. } => "recognition_error",
            Self::NoSchemaMatch { .. } => "no_schema_match",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecognitionError { message } => write!(f, "RecognitionError: {}", message),
            Self::NoSchemaMatch { best_score } => {
                write!(f, "NoSchemaMatch: best schema score {:.2}", best_score)
            }
            Self::StageTimeout { stage, timeout_ms } => {
                write!(f, "StageTimeout: {} exceeded {}ms", stage, timeout_ms)
            }
            Self::ValidationFailed { errors } => {
                write!(f, "ValidationFailed: {} error finding(s)", errors)
            }
            Self::Cancelled => write!(f, "Cancelled: batch abandoned before processing"),
            Self::Internal { message } => write!(f, "Internal: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid record transition from {from} to {to}")]
    Invalid {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Field '{field}' is not part of form {form_type}")]
    UnknownField { field: String, form_type: FormType },

    #[error("Fields resolved against form {got}, record was classified as {expected:?}")]
    FormMismatch {
        expected: Option<FormType>,
        got: FormType,
    },

    #[error("Missing {0} result")]
    MissingStageResult(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    id: Uuid,
    document: DocumentRef,
    hint: Option<FormType>,
    state: PipelineState,
    recognition: Option<RecognitionSummary>,
    entities: Vec<EntitySpan>,
    classification: Option<Classification>,
    fields: Vec<ResolvedField>,
    validation: Option<ValidationResult>,
    score: Option<ScoreBreakdown>,
    failure: Option<FailureReason>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    history: Vec<StateTransition>,
}

impl ProcessingRecord {
    pub fn new(document: DocumentRef, hint: Option<FormType>) -> Self {
        Self::with_id(Uuid::new_v4(), document, hint)
    }

    /// Start a record under an id assigned ahead of processing
    pub fn with_id(id: Uuid, document: DocumentRef, hint: Option<FormType>) -> Self {
        let now = Utc::now();
        Self {
            id,
            document,
            hint,
            state: PipelineState::Ingested,
            recognition: None,
            entities: Vec::new(),
            classification: None,
            fields: Vec::new(),
            validation: None,
            score: None,
            failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document(&self) -> &DocumentRef {
        &self.document
    }

    pub fn hint(&self) -> Option<FormType> {
        self.hint
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            PipelineState::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn recognition(&self) -> Option<&RecognitionSummary> {
        self.recognition.as_ref()
    }

    pub fn entities(&self) -> &[EntitySpan] {
        &self.entities
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    /// Chosen form, `None` when classification did not happen or failed
    pub fn form_type(&self) -> Option<FormType> {
        self.classification.as_ref().map(|c| c.form_type)
    }

    pub fn fields(&self) -> &[ResolvedField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn validation(&self) -> Option<&ValidationResult> {
        self.validation.as_ref()
    }

    pub fn score(&self) -> Option<&ScoreBreakdown> {
        self.score.as_ref()
    }

    /// Overall confidence, zero when the record never reached scoring
    pub fn confidence(&self) -> f64 {
        self.score.map(|s| s.overall).unwrap_or(0.0)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    fn transition(&mut self, to: PipelineState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(&to) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to,
            });
        }
        let now = Utc::now();
        self.history.push(StateTransition {
            from: self.state,
            to,
            at: now,
        });
        tracing::debug!(record_id = %self.id, from = %self.state, to = %to, "Record transition");
        self.state = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub(crate) fn record_recognition(
        &mut self,
        summary: RecognitionSummary,
        entities: Vec<EntitySpan>,
    ) -> Result<(), TransitionError> {
        self.transition(PipelineState::Recognized)?;
        self.recognition = Some(summary);
        self.entities = entities;
        Ok(())
    }

    pub(crate) fn record_classification(
        &mut self,
        classification: Classification,
    ) -> Result<(), TransitionError> {
        self.transition(PipelineState::Classified)?;
        self.classification = Some(classification);
        Ok(())
    }

    /// Only names drawn from the chosen schema are accepted
    pub(crate) fn record_resolution(
        &mut self,
        schema: &FormSchema,
        fields: Vec<ResolvedField>,
    ) -> Result<(), TransitionError> {
        if self.form_type() != Some(schema.form_type) {
            return Err(TransitionError::FormMismatch {
                expected: self.form_type(),
                got: schema.form_type,
            });
        }
        if let Some(stray) = fields.iter().find(|f| !schema.has_field(&f.name)) {
            return Err(TransitionError::UnknownField {
                field: stray.name.clone(),
                form_type: schema.form_type,
            });
        }
        self.transition(PipelineState::Resolved)?;
        self.fields = fields;
        Ok(())
    }

    pub(crate) fn record_validation(
        &mut self,
        validation: ValidationResult,
    ) -> Result<(), TransitionError> {
        self.transition(PipelineState::Validated)?;
        self.validation = Some(validation);
        Ok(())
    }

    pub(crate) fn record_score(&mut self, score: ScoreBreakdown) -> Result<(), TransitionError> {
        self.transition(PipelineState::Scored)?;
        self.score = Some(score);
        Ok(())
    }

    /// Move a scored record to its terminal outcome, derived from the verdict
    pub(crate) fn finish(&mut self) -> Result<Outcome, TransitionError> {
        let validation = self
            .validation
            .as_ref()
            .ok_or(TransitionError::MissingStageResult("validation"))?;
        let outcome = Outcome::from_verdict(validation.verdict);
        let errors = validation.errors().count();

        self.transition(PipelineState::Terminal(outcome))?;
        if outcome == Outcome::Failed {
            self.failure = Some(FailureReason::ValidationFailed { errors });
        }
        Ok(outcome)
    }

    /// Short-circuit to `Terminal(Failed)` from any live state
    pub(crate) fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        self.transition(PipelineState::Terminal(Outcome::Failed))?;
        self.failure = Some(reason);
        Ok(())
    }
}
