//! Submission Lifecycle Manager
//!
//! Turns a successful or partial record into an e-filing submission and
//! tracks it through the endpoint's protocol:
//!
//! ```text
//! NotSubmitted -> Prepared -> Submitted -> Acknowledged -> Accepted | Rejected
//!                              |    ^  \
//!                              +----+   +-> Rejected | TransportFailed
//!                              (retry)
//! ```
//!
//! Transient send failures are retried with capped exponential backoff up to
//! `RetryPolicy::max_attempts`; the backoff wait is cancellable through a
//! `watch` channel. Terminal submissions are never resubmitted.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::record::ProcessingRecord;
use crate::schema::FormType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    NotSubmitted,
    Prepared,
    Submitted,
    Acknowledged,
    Accepted,
    Rejected,
    /// Transient failures exhausted the retry budget
    TransportFailed,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSubmitted => "not_submitted",
            Self::Prepared => "prepared",
            Self::Submitted => "submitted",
            Self::Acknowledged => "acknowledged",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::TransportFailed => "transport_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Rejected | Self::TransportFailed
        )
    }

    pub fn can_transition_to(&self, target: &SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, target),
            (NotSubmitted, Prepared)
                | (Prepared, Submitted)
                | (Submitted, Submitted)
                | (Submitted, Acknowledged)
                | (Submitted, Rejected)
                | (Submitted, TransportFailed)
                | (Acknowledged, Accepted)
                | (Acknowledged, Rejected)
        )
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmissionError {
    #[error("Record {record_id} is not eligible for submission (outcome: {outcome})")]
    IneligibleForSubmission { record_id: Uuid, outcome: String },

    #[error("Submission {submission_id} is terminal ({state}), create a new submission to retry")]
    TerminalState {
        submission_id: Uuid,
        state: SubmissionState,
    },

    #[error("Invalid submission transition from {from} to {to}")]
    InvalidTransition {
        from: SubmissionState,
        to: SubmissionState,
    },

    #[error("Submission cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("No submission transport configured")]
    NoTransport,

    #[error("Submission has not been acknowledged by the endpoint")]
    NotSubmitted,
}

/// What is sent to the e-filing endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub record_id: Uuid,
    pub form_type: FormType,
    pub tax_year: i32,
    pub document_fingerprint: String,
    pub confidence: f64,
    /// Resolved field values by field name, unresolved fields omitted
    pub fields: BTreeMap<String, String>,
}

impl SubmissionPayload {
    /// Tax year comes from a resolved `tax_year` field, else the previous calendar year
    pub fn from_record(record: &ProcessingRecord, form_type: FormType) -> Self {
        let fields: BTreeMap<String, String> = record
            .fields()
            .iter()
            .filter_map(|f| f.value_str().map(|v| (f.name.clone(), v.trim().to_string())))
            .collect();
        let tax_year = fields
            .get("tax_year")
            .and_then(|y| y.parse::<i32>().ok())
            .unwrap_or_else(|| Utc::now().year() - 1);

        Self {
            record_id: record.id(),
            form_type,
            tax_year,
            document_fingerprint: record.document().fingerprint.clone(),
            confidence: record.confidence(),
            fields,
        }
    }
}

/// Endpoint answer to a send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TransportResponse {
    /// Receipt issued; final acceptance comes through status polling
    Accepted { reference_id: String },
    Rejected { reason: String },
    TransientError { reason: String },
}

/// Endpoint answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StatusResponse {
    Pending,
    Accepted,
    Rejected { reason: String },
    TransientError { reason: String },
}

/// External e-filing transport boundary
#[async_trait]
pub trait SubmissionTransport: Send + Sync {
    async fn send(&self, payload: &SubmissionPayload) -> TransportResponse;

    async fn status(&self, reference_id: &str) -> StatusResponse;
}

/// Retry schedule for transient send failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A send taking longer than this counts as a transient failure
    pub send_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            send_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), doubling and capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.pow(exp))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.send_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionTransition {
    pub from: SubmissionState,
    pub to: SubmissionState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    id: Uuid,
    record_id: Uuid,
    state: SubmissionState,
    reference_id: Option<String>,
    attempts: u32,
    last_error: Option<String>,
    payload: SubmissionPayload,
    history: Vec<SubmissionTransition>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Submission {
    /// Prepare a submission from a success or partial record.
    /// Anything else is refused without touching the transport.
    pub fn prepare(record: &ProcessingRecord) -> Result<Self, SubmissionError> {
        let ineligible = || SubmissionError::IneligibleForSubmission {
            record_id: record.id(),
            outcome: record
                .outcome()
                .map(|o| o.to_string())
                .unwrap_or_else(|| record.state().to_string()),
        };
        if !record.outcome().is_some_and(|o| o.is_submittable()) {
            return Err(ineligible());
        }
        let form_type = record.form_type().ok_or_else(ineligible)?;

        let now = Utc::now();
        let mut submission = Self {
            id: Uuid::new_v4(),
            record_id: record.id(),
            state: SubmissionState::NotSubmitted,
            reference_id: None,
            attempts: 0,
            last_error: None,
            payload: SubmissionPayload::from_record(record, form_type),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        submission.transition_to(SubmissionState::Prepared, None)?;
        Ok(submission)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn state(&self) -> SubmissionState {
        self.state
    }

    pub fn reference_id(&self) -> Option<&str> {
        self.reference_id.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn payload(&self) -> &SubmissionPayload {
        &self.payload
    }

    pub fn history(&self) -> &[SubmissionTransition] {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one lifecycle transition. Terminal submissions refuse all transitions.
    pub fn transition_to(
        &mut self,
        to: SubmissionState,
        note: Option<String>,
    ) -> Result<(), SubmissionError> {
        if self.state.is_terminal() {
            return Err(SubmissionError::TerminalState {
                submission_id: self.id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(&to) {
            return Err(SubmissionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let now = Utc::now();
        self.history.push(SubmissionTransition {
            from: self.state,
            to,
            at: now,
            note,
        });
        tracing::debug!(submission_id = %self.id, from = %self.state, to = %to, "Submission transition");
        self.state = to;
        self.updated_at = now;
        Ok(())
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolves once the flag is raised. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drives submissions against one transport under one retry policy
#[derive(Clone)]
pub struct SubmissionManager {
    transport: Arc<dyn SubmissionTransport>,
    policy: RetryPolicy,
}

impl SubmissionManager {
    pub fn new(transport: Arc<dyn SubmissionTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a prepared submission, retrying transient failures.
    ///
    /// Ends `Acknowledged`, `Rejected` or `TransportFailed`. On cancellation
    /// the submission is left `Submitted` with its attempt count; submitting
    /// it again resumes within the remaining retry budget.
    pub async fn submit(
        &self,
        submission: &mut Submission,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), SubmissionError> {
        if submission.is_terminal() {
            return Err(SubmissionError::TerminalState {
                submission_id: submission.id,
                state: submission.state,
            });
        }
        match submission.state {
            SubmissionState::Prepared => {}
            SubmissionState::Submitted => {
                tracing::info!(
                    submission_id = %submission.id,
                    attempts = submission.attempts,
                    "Resuming interrupted submission"
                );
                if submission.attempts >= self.policy.max_attempts {
                    let note = format!("retry budget of {} spent", self.policy.max_attempts);
                    return submission.transition_to(SubmissionState::TransportFailed, Some(note));
                }
            }
            state => {
                return Err(SubmissionError::InvalidTransition {
                    from: state,
                    to: SubmissionState::Submitted,
                })
            }
        }

        let send_timeout = Duration::from_millis(self.policy.send_timeout_ms);
        loop {
            if is_cancelled(cancel) {
                return Err(SubmissionError::Cancelled {
                    attempts: submission.attempts,
                });
            }

            let attempt = submission.attempts + 1;
            submission.transition_to(SubmissionState::Submitted, Some(format!("attempt {}", attempt)))?;
            submission.attempts = attempt;

            let response =
                match tokio::time::timeout(send_timeout, self.transport.send(&submission.payload))
                    .await
                {
                    Ok(response) => response,
                    Err(_) => TransportResponse::TransientError {
                        reason: format!("send timed out after {}ms", self.policy.send_timeout_ms),
                    },
                };

            match response {
                TransportResponse::Accepted { reference_id } => {
                    tracing::info!(
                        submission_id = %submission.id,
                        attempt,
                        reference_id = %reference_id,
                        "Submission acknowledged"
                    );
                    submission.reference_id = Some(reference_id);
                    return submission.transition_to(SubmissionState::Acknowledged, None);
                }
                TransportResponse::Rejected { reason } => {
                    tracing::warn!(submission_id = %submission.id, attempt, reason = %reason, "Submission rejected");
                    submission.last_error = Some(reason.clone());
                    return submission.transition_to(SubmissionState::Rejected, Some(reason));
                }
                TransportResponse::TransientError { reason } => {
                    submission.last_error = Some(reason.clone());
                    if attempt >= self.policy.max_attempts {
                        tracing::error!(
                            submission_id = %submission.id,
                            attempts = attempt,
                            reason = %reason,
                            "Submission exceeded max attempts"
                        );
                        return submission
                            .transition_to(SubmissionState::TransportFailed, Some(reason));
                    }

                    let backoff = self.policy.backoff_for(attempt);
                    tracing::warn!(
                        submission_id = %submission.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "Transient transport failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancelled(cancel) => {
                            tracing::info!(submission_id = %submission.id, attempts = attempt, "Submission retry cancelled");
                            return Err(SubmissionError::Cancelled { attempts: attempt });
                        }
                    }
                }
            }
        }
    }

    /// Refresh an acknowledged submission from the endpoint.
    /// Pending and transient answers leave the state unchanged.
    pub async fn poll(&self, submission: &mut Submission) -> Result<(), SubmissionError> {
        if submission.is_terminal() {
            return Err(SubmissionError::TerminalState {
                submission_id: submission.id,
                state: submission.state,
            });
        }
        if submission.state != SubmissionState::Acknowledged {
            return Err(SubmissionError::NotSubmitted);
        }
        let reference = submission
            .reference_id
            .clone()
            .ok_or(SubmissionError::NotSubmitted)?;

        let timeout = Duration::from_millis(self.policy.send_timeout_ms);
        let status = match tokio::time::timeout(timeout, self.transport.status(&reference)).await {
            Ok(status) => status,
            Err(_) => StatusResponse::TransientError {
                reason: format!("status query timed out after {}ms", self.policy.send_timeout_ms),
            },
        };

        match status {
            StatusResponse::Pending => {
                tracing::debug!(submission_id = %submission.id, reference_id = %reference, "Submission pending");
                Ok(())
            }
            StatusResponse::Accepted => {
                tracing::info!(submission_id = %submission.id, reference_id = %reference, "Submission accepted");
                submission.transition_to(SubmissionState::Accepted, None)
            }
            StatusResponse::Rejected { reason } => {
                tracing::warn!(submission_id = %submission.id, reason = %reason, "Submission rejected on review");
                submission.last_error = Some(reason.clone());
                submission.transition_to(SubmissionState::Rejected, Some(reason))
            }
            StatusResponse::TransientError { reason } => {
                tracing::warn!(submission_id = %submission.id, reason = %reason, "Status query failed");
                submission.last_error = Some(reason);
                Ok(())
            }
        }
    }
}
