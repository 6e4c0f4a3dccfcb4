//! Record Store
//!
//! Persistence boundary for processing records and submissions. Writes are
//! keyed by record or submission id; the pipeline never writes the same id
//! from two workers. Lookup by document fingerprint supports idempotent
//! reprocessing checks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::record::{Outcome, ProcessingRecord};
use crate::schema::FormType;
use crate::submission::Submission;

/// Query filter. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub fingerprint: Option<String>,
    pub form_type: Option<FormType>,
    pub outcome: Option<Outcome>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn form_type(mut self, form_type: FormType) -> Self {
        self.form_type = Some(form_type);
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn matches(&self, record: &ProcessingRecord) -> bool {
        self.fingerprint
            .as_deref()
            .is_none_or(|fp| record.document().fingerprint == fp)
            && self
                .form_type
                .is_none_or(|ft| record.form_type() == Some(ft))
            && self.outcome.is_none_or(|o| record.outcome() == Some(o))
    }
}

/// Persistence trait for records and submissions.
///
/// Backends serialize concurrent writes to the same id. Query results are
/// ordered by creation time.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Records ──

    /// Insert or replace a record, returning its id
    async fn save_record(&self, record: &ProcessingRecord) -> Result<Uuid>;
    async fn load_record(&self, id: Uuid) -> Result<Option<ProcessingRecord>>;
    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<ProcessingRecord>>;

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<ProcessingRecord>> {
        self.query_records(&RecordFilter::all().fingerprint(fingerprint))
            .await
    }

    // ── Submissions ──

    async fn save_submission(&self, submission: &Submission) -> Result<Uuid>;
    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>>;
    async fn list_submissions(&self) -> Result<Vec<Submission>>;
}

fn sort_records(records: &mut [ProcessingRecord]) {
    records.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then(a.id().cmp(&b.id()))
    });
}

fn sort_submissions(submissions: &mut [Submission]) {
    submissions.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then(a.id().cmp(&b.id()))
    });
}

/// In-memory store for tests and single-run CLI use
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, ProcessingRecord>>,
    submissions: RwLock<HashMap<Uuid, Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save_record(&self, record: &ProcessingRecord) -> Result<Uuid> {
        self.records
            .write()
            .await
            .insert(record.id(), record.clone());
        Ok(record.id())
    }

    async fn load_record(&self, id: Uuid) -> Result<Option<ProcessingRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<ProcessingRecord>> {
        let mut found: Vec<ProcessingRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut found);
        Ok(found)
    }

    async fn save_submission(&self, submission: &Submission) -> Result<Uuid> {
        self.submissions
            .write()
            .await
            .insert(submission.id(), submission.clone());
        Ok(submission.id())
    }

    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>> {
        Ok(self.submissions.read().await.get(&id).cloned())
    }

    async fn list_submissions(&self) -> Result<Vec<Submission>> {
        let mut all: Vec<Submission> = self.submissions.read().await.values().cloned().collect();
        sort_submissions(&mut all);
        Ok(all)
    }
}

/// One pretty-printed JSON file per record and per submission:
///
/// ```text
/// <root>/records/<uuid>.json
/// <root>/submissions/<uuid>.json
/// ```
///
/// Files are written to a temporary name and renamed into place so readers
/// never see a partial file. Writes go through one mutex.
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

const RECORDS_DIR: &str = "records";
const SUBMISSIONS_DIR: &str = "submissions";

impl JsonFileStore {
    /// Open a store rooted at `root`, creating its directories
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [RECORDS_DIR, SUBMISSIONS_DIR] {
            let path = root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Failed to create store directory {}", path.display()))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, dir: &str, id: Uuid) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", id))
    }

    async fn write_json<T: Serialize>(&self, dir: &str, id: Uuid, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)?;
        let path = self.path_for(dir, id);
        let tmp = path.with_extension("json.tmp");

        let _guard = self.write_lock.lock().await;
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Corrupt store file {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn read_dir<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let mut entries = tokio::fs::read_dir(self.root.join(dir)).await?;
        let mut values = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(value) = self.read_json(&path).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn save_record(&self, record: &ProcessingRecord) -> Result<Uuid> {
        self.write_json(RECORDS_DIR, record.id(), record).await?;
        Ok(record.id())
    }

    async fn load_record(&self, id: Uuid) -> Result<Option<ProcessingRecord>> {
        self.read_json(&self.path_for(RECORDS_DIR, id)).await
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<ProcessingRecord>> {
        let mut found: Vec<ProcessingRecord> = self
            .read_dir::<ProcessingRecord>(RECORDS_DIR)
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        sort_records(&mut found);
        Ok(found)
    }

    async fn save_submission(&self, submission: &Submission) -> Result<Uuid> {
        self.write_json(SUBMISSIONS_DIR, submission.id(), submission)
            .await?;
        Ok(submission.id())
    }

    async fn load_submission(&self, id: Uuid) -> Result<Option<Submission>> {
        self.read_json(&self.path_for(SUBMISSIONS_DIR, id)).await
    }

    async fn list_submissions(&self) -> Result<Vec<Submission>> {
        let mut all = self.read_dir::<Submission>(SUBMISSIONS_DIR).await?;
        sort_submissions(&mut all);
        Ok(all)
    }
}
