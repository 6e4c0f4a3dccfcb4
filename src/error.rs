//! Crate-level error type
//!
//! Local document failures (unreadable input, no schema match, stage timeout,
//! invalid form) are not errors: they end the record `failed`. This type
//! covers what the caller must handle.

use crate::config::ConfigError;
use crate::record::TransitionError;
use crate::submission::SubmissionError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("Record not found: {0}")]
    RecordNotFound(uuid::Uuid),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
