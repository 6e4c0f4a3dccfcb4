//! Tax Form Pipeline CLI
//!
//! Usage:
//!   taxform process scans/w2.txt --form-type W2
//!   taxform batch scans/ --auto-submit
//!   taxform stats
//!   taxform submit <record-id>
//!   taxform resume <submission-id>
//!   taxform poll <submission-id>
//!
//! Records and submissions persist as JSON under `--store-dir`. Settings come
//! from `--config` (YAML) overlaid with `TAXFORM_*` environment variables; a
//! `.env` file is honoured.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taxform_pipeline::entity::PatternEntityExtractor;
use taxform_pipeline::recognition::TextLayerRecognizer;
use taxform_pipeline::schema::SchemaRegistry;
use taxform_pipeline::store::JsonFileStore;
use taxform_pipeline::transport::HttpSubmissionTransport;
use taxform_pipeline::{Document, FormType, Pipeline, PipelineConfig};

/// Tax document processing pipeline
#[derive(Parser, Debug)]
#[command(name = "taxform")]
#[command(about = "Recognize, classify, validate and submit tax documents")]
struct Args {
    /// YAML configuration file
    #[arg(long, short = 'c', global = true, env = "TAXFORM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding stored records and submissions
    #[arg(long, global = true, env = "TAXFORM_STORE_DIR", default_value = ".taxform")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process a single document
    Process {
        file: PathBuf,

        /// Expected form type (e.g. "W2", "1040", "1099-NEC")
        #[arg(long, short = 'f')]
        form_type: Option<FormType>,
    },

    /// Process every .txt/.text/.json file in a directory
    Batch {
        dir: PathBuf,

        /// Submit success and partial records as they finish
        #[arg(long)]
        auto_submit: bool,

        /// Override max concurrent documents
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
    },

    /// Show statistics over stored records and submissions
    Stats,

    /// Submit a stored record
    Submit { record_id: Uuid },

    /// Resume a stored submission interrupted mid-retry
    Resume { submission_id: Uuid },

    /// Refresh a stored submission's status
    Poll { submission_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taxform_pipeline=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config =
        PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Process { file, form_type } => {
            let pipeline = build_pipeline(config, &args.store_dir).await?;
            let document = Document::from_path(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let record = pipeline.process(&document, form_type).await?;
            print_json(&record)?;
        }
        Command::Batch {
            dir,
            auto_submit,
            concurrency,
        } => {
            config.auto_submit |= auto_submit;
            if let Some(concurrency) = concurrency {
                config.max_concurrency = concurrency;
            }
            let pipeline = build_pipeline(config, &args.store_dir).await?;
            let documents = load_directory(&dir).await?;
            tracing::info!(dir = %dir.display(), documents = documents.len(), "Loaded batch");

            let summary = pipeline.process_batch(documents).await;
            print_json(&summary)?;
        }
        Command::Stats => {
            let pipeline = build_pipeline(config, &args.store_dir).await?;
            print_json(&pipeline.statistics().await?)?;
        }
        Command::Submit { record_id } => {
            let pipeline = build_pipeline(config, &args.store_dir).await?;
            let submission = pipeline.submit_record(record_id).await?;
            print_json(&submission)?;
        }
        Command::Resume { submission_id } => {
            let pipeline = build_pipeline(config, &args.store_dir).await?;
            let submission = pipeline.resume_stored(submission_id).await?;
            print_json(&submission)?;
        }
        Command::Poll { submission_id } => {
            let pipeline = build_pipeline(config, &args.store_dir).await?;
            let submission = pipeline.poll_stored(submission_id).await?;
            print_json(&submission)?;
        }
    }

    Ok(())
}

async fn build_pipeline(config: PipelineConfig, store_dir: &Path) -> Result<Pipeline> {
    let registry = match &config.schema_path {
        Some(path) => {
            let yaml = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read schemas from {}", path.display()))?;
            SchemaRegistry::from_yaml(&yaml)
                .with_context(|| format!("Invalid schema file {}", path.display()))?
        }
        None => SchemaRegistry::builtin(),
    };

    let store = JsonFileStore::open(store_dir)
        .await
        .with_context(|| format!("Failed to open store at {}", store_dir.display()))?;

    let mut builder = Pipeline::builder(
        Arc::new(TextLayerRecognizer::default()),
        Arc::new(PatternEntityExtractor::new()),
    )
    .registry(registry)
    .store(Arc::new(store));

    if let Some(endpoint) = &config.submission_endpoint {
        let timeout = Duration::from_millis(config.retry.send_timeout_ms);
        let transport = HttpSubmissionTransport::new(
            endpoint,
            timeout,
            config.submission_api_key.as_deref(),
        )?;
        builder = builder.transport(Arc::new(transport));
    }

    Ok(builder.config(config).build()?)
}

async fn load_directory(dir: &Path) -> Result<Vec<Document>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "txt" | "text" | "json"));
        if supported && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let document = Document::from_path(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        documents.push(document);
    }
    Ok(documents)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
