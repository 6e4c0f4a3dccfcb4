//! End-to-end processing through the orchestrator

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::*;
use taxform_pipeline::recognition::{RecognitionError, TextLayerRecognizer};
use taxform_pipeline::record::{FailureReason, PipelineState};
use taxform_pipeline::store::{JsonFileStore, RecordFilter, RecordStore};
use taxform_pipeline::validator::Severity;
use taxform_pipeline::{FormType, Outcome, Pipeline, PipelineConfig};

#[tokio::test]
async fn test_clean_w2_succeeds_with_high_confidence() {
    let pipeline = builder().build().unwrap();
    let record = pipeline.process(&w2_document(), None).await.unwrap();

    assert_eq!(record.outcome(), Some(Outcome::Success));
    assert_eq!(record.form_type(), Some(FormType::W2));
    assert!(record.confidence() >= 0.85, "confidence {}", record.confidence());
    assert!(record.failure().is_none());

    let recognition = record.recognition().unwrap();
    assert_eq!(recognition.engine, "text-layer");
    assert_eq!(recognition.extractor, "pattern");

    assert_eq!(record.field("employee_ssn").unwrap().value_str(), Some("987-65-4321"));
    assert_eq!(record.field("employer_ein").unwrap().value_str(), Some("12-3456789"));
    assert_eq!(record.field("wages").unwrap().value_str(), Some("$52,000.00"));
    assert_eq!(record.field("employee_name").unwrap().value_str(), Some("Jane Q Public"));
    assert_eq!(record.field("employer_name").unwrap().value_str(), Some("Acme Manufacturing Inc"));
    assert!(!record.field("state_wages").unwrap().is_resolved());

    let states: Vec<PipelineState> = record.history().iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            PipelineState::Recognized,
            PipelineState::Classified,
            PipelineState::Resolved,
            PipelineState::Validated,
            PipelineState::Scored,
            PipelineState::Terminal(Outcome::Success),
        ]
    );
    assert!(record.completed_at().is_some());
}

#[tokio::test]
async fn test_unrecognizable_form_fails_without_fields() {
    let pipeline = builder().build().unwrap();
    let record = pipeline
        .process(&text_document("notes.txt", NOISE), None)
        .await
        .unwrap();

    assert_eq!(record.outcome(), Some(Outcome::Failed));
    assert!(matches!(record.failure(), Some(FailureReason::NoSchemaMatch { .. })));
    assert!(record.fields().is_empty());
    assert!(record.classification().is_none());
    assert_eq!(record.confidence(), 0.0);
    assert_eq!(record.state(), PipelineState::Terminal(Outcome::Failed));
}

#[tokio::test]
async fn test_missing_required_field_is_invalid() {
    let pipeline = builder().build().unwrap();
    let record = pipeline
        .process(&text_document("1040.txt", F1040_WITHOUT_TOTAL), None)
        .await
        .unwrap();

    assert_eq!(record.form_type(), Some(FormType::Form1040));
    assert_eq!(record.outcome(), Some(Outcome::Failed));
    assert!(matches!(record.failure(), Some(FailureReason::ValidationFailed { errors }) if *errors >= 1));

    let validation = record.validation().unwrap();
    assert!(validation
        .errors()
        .any(|f| f.field == "total_income" && f.rule == "required" && f.severity == Severity::Error));
    assert_eq!(record.score().unwrap().overall, 0.0);
    // Fields that did resolve are still reported
    assert_eq!(record.field("filing_status").unwrap().value_str(), Some("Single"));
}

#[tokio::test]
async fn test_unsupported_document_is_recognition_failure() {
    let pipeline = builder().build().unwrap();
    let record = pipeline
        .process(&text_document("scan.pdf", "%PDF-1.7"), None)
        .await
        .unwrap();

    assert_eq!(record.outcome(), Some(Outcome::Failed));
    assert_eq!(record.failure().map(|f| f.kind()), Some("recognition_error"));
    assert!(record.recognition().is_none());
}

#[tokio::test]
async fn test_placeholder_ssn_is_partial() {
    let pipeline = builder().build().unwrap();
    let text = CLEAN_W2.replace("987-65-4321", "123-45-6789");
    let record = pipeline
        .process(&text_document("w2.txt", &text), None)
        .await
        .unwrap();

    assert_eq!(record.outcome(), Some(Outcome::Partial));
    let validation = record.validation().unwrap();
    assert_eq!(validation.errors().count(), 0);
    assert!(validation
        .warnings()
        .any(|f| f.field == "employee_ssn" && f.rule == "ssn_format"));
    assert!(record.confidence() > 0.0);
    assert!(record.failure().is_none());
}

#[tokio::test]
async fn test_low_recognition_confidence_lowers_score() {
    let clean = builder().build().unwrap();
    let blurry = builder_with(Arc::new(FixedRecognizer::lines(CLEAN_W2, 0.5)))
        .build()
        .unwrap();

    let sharp = clean.process(&w2_document(), None).await.unwrap();
    let faint = blurry.process(&w2_document(), None).await.unwrap();

    assert_eq!(faint.outcome(), Some(Outcome::Success));
    assert_eq!(faint.recognition().unwrap().engine, "fixed");
    assert!(faint.confidence() < sharp.confidence());
}

#[tokio::test]
async fn test_adapter_error_reason_is_kept() {
    let pipeline = builder_with(Arc::new(FixedRecognizer::error(RecognitionError::Corrupt(
        "truncated page stream".to_string(),
    ))))
    .build()
    .unwrap();
    let record = pipeline.process(&w2_document(), None).await.unwrap();

    match record.failure() {
        Some(FailureReason::RecognitionError { message }) => {
            assert!(message.contains("truncated page stream"))
        }
        other => panic!("unexpected failure {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_recognition_times_out() {
    let mut config = PipelineConfig::default();
    config.stage_timeout_ms = 50;
    let pipeline = builder_with(Arc::new(SlowRecognizer {
        delay: Duration::from_secs(60),
    }))
    .config(config)
    .build()
    .unwrap();

    let record = pipeline.process(&w2_document(), None).await.unwrap();

    assert_eq!(record.outcome(), Some(Outcome::Failed));
    assert_eq!(
        record.failure(),
        Some(&FailureReason::StageTimeout {
            stage: "recognition".to_string(),
            timeout_ms: 50,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_extraction_times_out() {
    let mut config = PipelineConfig::default();
    config.stage_timeout_ms = 50;
    let pipeline = Pipeline::builder(
        Arc::new(TextLayerRecognizer::default()),
        Arc::new(SlowExtractor {
            delay: Duration::from_secs(60),
        }),
    )
    .config(config)
    .build()
    .unwrap();

    let record = pipeline.process(&w2_document(), None).await.unwrap();

    assert_eq!(record.outcome(), Some(Outcome::Failed));
    assert_eq!(
        record.failure(),
        Some(&FailureReason::StageTimeout {
            stage: "extraction".to_string(),
            timeout_ms: 50,
        })
    );
    assert!(record.recognition().is_none());
}

#[tokio::test]
async fn test_reprocessing_is_deterministic() {
    let pipeline = builder().build().unwrap();
    let first = pipeline.process(&w2_document(), None).await.unwrap();
    let second = pipeline.process(&w2_document(), None).await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(first.outcome(), second.outcome());
    assert_eq!(first.classification(), second.classification());
    assert_eq!(first.fields(), second.fields());
    assert_eq!(first.validation(), second.validation());
    assert_eq!(first.confidence(), second.confidence());
}

#[tokio::test]
async fn test_reuse_returns_stored_terminal_record() {
    let mut config = PipelineConfig::default();
    config.reuse_terminal_records = true;
    let pipeline = builder().config(config).build().unwrap();

    let first = pipeline.process(&w2_document(), None).await.unwrap();
    let renamed = text_document("copy-of-w2.txt", CLEAN_W2);
    let second = pipeline.process(&renamed, None).await.unwrap();
    assert_eq!(first.id(), second.id());

    // A different hint is a different request
    let hinted = pipeline.process(&renamed, Some(FormType::W2)).await.unwrap();
    assert_ne!(first.id(), hinted.id());

    let stored = pipeline.store().query_records(&RecordFilter::all()).await.unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_hint_breaks_close_classification() {
    let pipeline = builder().build().unwrap();
    let text = "filing status\ntaxable income\nfederal income tax withheld\nsocial security wages\nemployee\n";

    let unhinted = pipeline.process(&text_document("a.txt", text), None).await.unwrap();
    assert_eq!(unhinted.form_type(), Some(FormType::W2));

    let declared = text_document("a.txt", text).with_declared_form(FormType::Form1040);
    let hinted = pipeline.process(&declared, None).await.unwrap();
    assert_eq!(hinted.form_type(), Some(FormType::Form1040));
    assert_eq!(hinted.hint(), Some(FormType::Form1040));
}

#[tokio::test]
async fn test_statistics_over_store() {
    let pipeline = builder().build().unwrap();
    pipeline.process(&w2_document(), None).await.unwrap();
    pipeline
        .process(&text_document("notes.txt", NOISE), None)
        .await
        .unwrap();

    let stats = pipeline.statistics().await.unwrap();
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.in_progress, 0);
    assert_eq!(stats.outcomes.get(&Outcome::Success), Some(&1));
    assert_eq!(stats.outcomes.get(&Outcome::Failed), Some(&1));
    assert_eq!(stats.form_types.get(&FormType::W2), Some(&1));
}

#[tokio::test]
async fn test_records_survive_file_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::open(dir.path()).await.unwrap();
    let pipeline = builder().store(Arc::new(store)).build().unwrap();
    let record = pipeline.process(&w2_document(), None).await.unwrap();

    let reopened = JsonFileStore::open(dir.path()).await.unwrap();
    let loaded = reopened.load_record(record.id()).await.unwrap().unwrap();
    assert_eq!(loaded.outcome(), Some(Outcome::Success));
    assert_eq!(loaded.form_type(), record.form_type());
    assert_eq!(loaded.history().len(), record.history().len());
    assert_eq!(
        loaded.field("employee_ssn").and_then(|f| f.value_str()),
        Some("987-65-4321")
    );
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_build() {
    let mut config = PipelineConfig::default();
    config.max_concurrency = 0;
    assert!(builder().config(config).build().is_err());
}
