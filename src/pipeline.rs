//! Pipeline Orchestrator
//!
//! Runs one document through
//! `Ingested -> Recognized -> Classified -> Resolved -> Validated -> Scored -> Terminal`
//! and owns its [`ProcessingRecord`]. Local failures (recognition errors, no
//! schema match, stage timeouts) end the record `failed` with the reason kept
//! on the record; they are not returned as errors.
//!
//! Batches run one worker task per document behind a semaphore. Each worker
//! owns its record and any submission it makes. A worker that panics still
//! yields a failed record, so every input produces exactly one record.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::classifier::{ClassificationError, FormClassifier};
use crate::config::PipelineConfig;
use crate::document::{Document, DocumentRef};
use crate::entity::{attach_blocks, EntityExtractor};
use crate::error::{PipelineError, Result};
use crate::recognition::{RecognitionAdapter, RecognitionSummary, TextLayer};
use crate::record::{FailureReason, ProcessingRecord};
use crate::report::{BatchSummary, ProcessingStatistics};
use crate::resolver::FieldResolver;
use crate::schema::{FormType, SchemaRegistry};
use crate::scoring::ConfidenceScorer;
use crate::store::{MemoryStore, RecordFilter, RecordStore};
use crate::submission::{Submission, SubmissionError, SubmissionManager, SubmissionTransport};
use crate::validator::Validator;

/// Builder for [`Pipeline`]. Collaborators are constructed once by the caller
/// and shared by reference.
pub struct PipelineBuilder {
    recognizer: Arc<dyn RecognitionAdapter>,
    extractor: Arc<dyn EntityExtractor>,
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn RecordStore>,
    transport: Option<Arc<dyn SubmissionTransport>>,
    validator: Option<Validator>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn SubmissionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the validator built from config (e.g. one pinned to a fixed date)
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        Ok(Pipeline {
            recognizer: self.recognizer,
            extractor: self.extractor,
            classifier: FormClassifier::new(self.registry.clone(), config.classifier.clone()),
            registry: self.registry,
            resolver: FieldResolver::with_rules(config.resolver_rules.clone()),
            validator: self
                .validator
                .unwrap_or_else(|| Validator::new(config.validator.clone())),
            scorer: ConfidenceScorer::new(config.scoring.clone()),
            store: self.store,
            submissions: self
                .transport
                .map(|t| SubmissionManager::new(t, config.retry.clone())),
            config,
        })
    }
}

/// The orchestrator. Cheap to clone; batch workers each hold a clone.
#[derive(Clone)]
pub struct Pipeline {
    recognizer: Arc<dyn RecognitionAdapter>,
    extractor: Arc<dyn EntityExtractor>,
    registry: Arc<SchemaRegistry>,
    classifier: FormClassifier,
    resolver: FieldResolver,
    validator: Validator,
    scorer: ConfidenceScorer,
    store: Arc<dyn RecordStore>,
    submissions: Option<SubmissionManager>,
    config: Arc<PipelineConfig>,
}

/// Outcome of a bounded external call
enum StageCall<T> {
    Done(T),
    TimedOut,
}

impl Pipeline {
    /// Start a builder with built-in schemas, an in-memory store and default config
    pub fn builder(
        recognizer: Arc<dyn RecognitionAdapter>,
        extractor: Arc<dyn EntityExtractor>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            recognizer,
            extractor,
            registry: Arc::new(SchemaRegistry::builtin()),
            store: Arc::new(MemoryStore::new()),
            transport: None,
            validator: None,
            config: PipelineConfig::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Process one document. `hint` falls back to the document's declared form.
    ///
    /// Always yields a terminal record unless the store fails.
    pub async fn process(
        &self,
        document: &Document,
        hint: Option<FormType>,
    ) -> Result<ProcessingRecord> {
        self.process_as(Uuid::new_v4(), document, hint).await
    }

    /// As [`Pipeline::process`], storing the new record under `record_id`
    async fn process_as(
        &self,
        record_id: Uuid,
        document: &Document,
        hint: Option<FormType>,
    ) -> Result<ProcessingRecord> {
        let hint = hint.or(document.declared_form());

        if self.config.reuse_terminal_records {
            if let Some(existing) = self.find_reusable(document, hint).await? {
                tracing::info!(
                    record_id = %existing.id(),
                    fingerprint = %document.fingerprint(),
                    "Reusing terminal record for identical document"
                );
                return Ok(existing);
            }
        }

        let mut record = ProcessingRecord::with_id(record_id, document.reference(), hint);
        self.store.save_record(&record).await?;
        tracing::debug!(
            record_id = %record.id(),
            source = %document.source().name(),
            hint = ?hint,
            "Document ingested"
        );

        self.run_stages(document, hint, &mut record).await?;
        self.store.save_record(&record).await?;

        tracing::info!(
            record_id = %record.id(),
            outcome = ?record.outcome(),
            form_type = ?record.form_type(),
            confidence = record.confidence(),
            "Document processed"
        );
        Ok(record)
    }

    async fn find_reusable(
        &self,
        document: &Document,
        hint: Option<FormType>,
    ) -> Result<Option<ProcessingRecord>> {
        let existing = self
            .store
            .query_records(&RecordFilter::all().fingerprint(document.fingerprint()))
            .await?;
        Ok(existing
            .into_iter()
            .rev()
            .find(|r| r.is_terminal() && r.hint() == hint))
    }

    async fn bounded<T>(&self, fut: impl Future<Output = T>) -> StageCall<T> {
        match tokio::time::timeout(self.config.stage_timeout(), fut).await {
            Ok(value) => StageCall::Done(value),
            Err(_) => StageCall::TimedOut,
        }
    }

    fn fail(&self, record: &mut ProcessingRecord, reason: FailureReason) -> Result<()> {
        tracing::warn!(
            record_id = %record.id(),
            stage = %record.state(),
            reason = %reason,
            "Document failed"
        );
        record.fail(reason)?;
        Ok(())
    }

    fn timeout_reason(&self, stage: &str) -> FailureReason {
        FailureReason::StageTimeout {
            stage: stage.to_string(),
            timeout_ms: self.config.stage_timeout_ms,
        }
    }

    async fn run_stages(
        &self,
        document: &Document,
        hint: Option<FormType>,
        record: &mut ProcessingRecord,
    ) -> Result<()> {
        // Recognized: the two external collaborator calls, each bounded
        let blocks = match self.bounded(self.recognizer.recognize(document)).await {
            StageCall::Done(Ok(blocks)) => blocks,
            StageCall::Done(Err(e)) => {
                return self.fail(
                    record,
                    FailureReason::RecognitionError {
                        message: e.to_string(),
                    },
                )
            }
            StageCall::TimedOut => return self.fail(record, self.timeout_reason("recognition")),
        };

        let layer = TextLayer::from_blocks(&blocks);
        let mut spans = match self.bounded(self.extractor.extract(layer.text())).await {
            StageCall::Done(spans) => spans,
            StageCall::TimedOut => return self.fail(record, self.timeout_reason("extraction")),
        };
        attach_blocks(&mut spans, &layer);

        let summary = RecognitionSummary::from_blocks(
            self.recognizer.engine_name(),
            self.extractor.model_name(),
            &blocks,
            spans.len(),
        );
        record.record_recognition(summary, spans)?;

        // Classified
        let classification = match self.classifier.classify(layer.text(), hint, record.entities()) {
            Ok(classification) => classification,
            Err(ClassificationError::NoSchemaMatch { best_score, .. }) => {
                return self.fail(record, FailureReason::NoSchemaMatch { best_score })
            }
        };
        let Some(schema) = self.registry.get(classification.form_type) else {
            return self.fail(
                record,
                FailureReason::Internal {
                    message: format!("schema {} missing from registry", classification.form_type),
                },
            );
        };
        record.record_classification(classification)?;

        // Resolved
        let fields = self.resolver.resolve(schema, record.entities());
        record.record_resolution(schema, fields)?;

        // Validated
        let validation = self.validator.validate(schema, record.fields());
        let verdict = validation.verdict;
        record.record_validation(validation)?;

        // Scored
        let score = self.scorer.score(&blocks, schema, record.fields(), verdict);
        record.record_score(score)?;

        record.finish()?;
        Ok(())
    }

    /// Process a batch. Every document yields one record, in input order.
    pub async fn process_batch(&self, documents: Vec<Document>) -> BatchSummary {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.process_batch_with_cancel(documents, cancel_rx).await
    }

    /// Process a batch that the caller may abandon by raising `cancel`.
    ///
    /// Documents not yet started when cancelled end `failed` with reason
    /// `Cancelled`; auto-submissions stop retrying.
    pub async fn process_batch_with_cancel(
        &self,
        documents: Vec<Document>,
        cancel: watch::Receiver<bool>,
    ) -> BatchSummary {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        tracing::info!(
            batch_id = %batch_id,
            documents = documents.len(),
            max_concurrency = self.config.max_concurrency,
            "Batch started"
        );

        let mut handles = Vec::with_capacity(documents.len());
        for document in documents {
            let record_id = Uuid::new_v4();
            let reference = document.reference();
            let hint = document.declared_form();
            let pipeline = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                pipeline.run_worker(record_id, document, cancel).await
            });
            handles.push((record_id, reference, hint, handle));
        }

        let mut records = Vec::with_capacity(handles.len());
        let mut submissions = Vec::new();
        for (record_id, reference, hint, handle) in handles {
            let (record, submission) = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!(batch_id = %batch_id, error = %join_error, "Batch worker panicked");
                    let record = self
                        .failed_record(
                            record_id,
                            reference,
                            hint,
                            FailureReason::Internal {
                                message: format!("worker failed: {}", join_error),
                            },
                        )
                        .await;
                    (record, None)
                }
            };
            records.push(record);
            submissions.extend(submission);
        }

        let summary = BatchSummary::new(batch_id, started_at, records, submissions);
        tracing::info!(
            batch_id = %batch_id,
            total = summary.total,
            failed = summary.failures.len(),
            mean_confidence = summary.mean_confidence,
            "Batch complete"
        );
        summary
    }

    async fn run_worker(
        &self,
        record_id: Uuid,
        document: Document,
        mut cancel: watch::Receiver<bool>,
    ) -> (ProcessingRecord, Option<Submission>) {
        let hint = document.declared_form();
        if *cancel.borrow() {
            let record = self
                .failed_record(record_id, document.reference(), hint, FailureReason::Cancelled)
                .await;
            return (record, None);
        }

        let record = match self.process_as(record_id, &document, hint).await {
            Ok(record) => record,
            Err(e) => {
                let record = self
                    .failed_record(
                        record_id,
                        document.reference(),
                        hint,
                        FailureReason::Internal {
                            message: e.to_string(),
                        },
                    )
                    .await;
                return (record, None);
            }
        };

        let eligible = record.outcome().is_some_and(|o| o.is_submittable());
        if !(self.config.auto_submit && eligible) {
            return (record, None);
        }
        let submission = match self.submit_with_cancel(&record, &mut cancel).await {
            Ok(submission) => Some(submission),
            Err(e) => {
                tracing::warn!(record_id = %record.id(), error = %e, "Auto-submit failed");
                None
            }
        };
        (record, submission)
    }

    /// Build, fail and persist a record for a document the worker could not
    /// process. Reusing the worker's id replaces any record it already saved.
    async fn failed_record(
        &self,
        record_id: Uuid,
        reference: DocumentRef,
        hint: Option<FormType>,
        reason: FailureReason,
    ) -> ProcessingRecord {
        let mut record = ProcessingRecord::with_id(record_id, reference, hint);
        if let Err(e) = self.fail(&mut record, reason) {
            tracing::error!(record_id = %record.id(), error = %e, "Could not fail fresh record");
        }
        if let Err(e) = self.store.save_record(&record).await {
            tracing::error!(record_id = %record.id(), error = %e, "Could not persist failed record");
        }
        record
    }

    /// Prepare and send a submission for a success or partial record
    pub async fn submit(&self, record: &ProcessingRecord) -> Result<Submission> {
        let (_cancel_tx, mut cancel) = watch::channel(false);
        self.submit_with_cancel(record, &mut cancel).await
    }

    /// As [`Pipeline::submit`], abandoning retries when `cancel` is raised.
    /// The submission is persisted in whatever state it reached.
    pub async fn submit_with_cancel(
        &self,
        record: &ProcessingRecord,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Submission> {
        let mut submission = Submission::prepare(record)?;
        let manager = self
            .submissions
            .as_ref()
            .ok_or(SubmissionError::NoTransport)?;

        self.store.save_submission(&submission).await?;
        let sent = manager.submit(&mut submission, cancel).await;
        self.store.save_submission(&submission).await?;
        sent?;

        tracing::info!(
            record_id = %record.id(),
            submission_id = %submission.id(),
            state = %submission.state(),
            attempts = submission.attempts(),
            "Submission sent"
        );
        Ok(submission)
    }

    /// Continue a submission left `Submitted` by a cancelled run, spending
    /// only what remains of its retry budget
    pub async fn resume_submission(
        &self,
        submission: &Submission,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Submission> {
        let manager = self
            .submissions
            .as_ref()
            .ok_or(SubmissionError::NoTransport)?;
        let mut resumed = submission.clone();
        let sent = manager.submit(&mut resumed, cancel).await;
        self.store.save_submission(&resumed).await?;
        sent?;
        Ok(resumed)
    }

    /// Refresh a submission's external status
    pub async fn poll_submission(&self, submission: &Submission) -> Result<Submission> {
        let manager = self
            .submissions
            .as_ref()
            .ok_or(SubmissionError::NoTransport)?;
        let mut refreshed = submission.clone();
        manager.poll(&mut refreshed).await?;
        self.store.save_submission(&refreshed).await?;
        Ok(refreshed)
    }

    /// Load a stored record and submit it
    pub async fn submit_record(&self, record_id: Uuid) -> Result<Submission> {
        let record = self
            .store
            .load_record(record_id)
            .await?
            .ok_or(PipelineError::RecordNotFound(record_id))?;
        self.submit(&record).await
    }

    /// Load a stored submission and resume sending it
    pub async fn resume_stored(&self, submission_id: Uuid) -> Result<Submission> {
        let submission = self
            .store
            .load_submission(submission_id)
            .await?
            .ok_or(PipelineError::RecordNotFound(submission_id))?;
        let (_cancel_tx, mut cancel) = watch::channel(false);
        self.resume_submission(&submission, &mut cancel).await
    }

    /// Load a stored submission and poll it
    pub async fn poll_stored(&self, submission_id: Uuid) -> Result<Submission> {
        let submission = self
            .store
            .load_submission(submission_id)
            .await?
            .ok_or(PipelineError::RecordNotFound(submission_id))?;
        self.poll_submission(&submission).await
    }

    pub async fn statistics(&self) -> Result<ProcessingStatistics> {
        let records = self.store.query_records(&RecordFilter::all()).await?;
        let submissions = self.store.list_submissions().await?;
        Ok(ProcessingStatistics::from_parts(&records, &submissions))
    }
}
