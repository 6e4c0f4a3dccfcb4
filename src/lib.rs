//! Tax Form Pipeline
//!
//! Turns scanned or printed tax documents into validated, scored records and
//! optionally tracks their e-filing submission.
//!
//! Stages, leaves first:
//! - `recognition` / `entity`: boundaries to the external OCR and entity services
//! - `classifier`: picks the [`schema::FormSchema`] for a document
//! - `resolver`: binds entity spans to schema fields
//! - `validator`: applies per-schema business rules
//! - `scoring`: folds everything into one trust score
//! - `pipeline`: sequences the above per document or per batch
//! - `submission`: e-filing lifecycle with bounded retry

pub mod classifier;
pub mod config;
pub mod document;
pub mod entity;
pub mod error;
pub mod pipeline;
pub mod recognition;
pub mod record;
pub mod report;
pub mod resolver;
pub mod schema;
pub mod scoring;
pub mod store;
pub mod submission;
pub mod transport;
pub mod validator;

pub use config::PipelineConfig;
pub use document::Document;
pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use record::{Outcome, ProcessingRecord};
pub use report::BatchSummary;
pub use schema::{FormSchema, FormType};
pub use submission::{Submission, SubmissionState};
