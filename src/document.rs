//! Document Types
//!
//! A document is an immutable byte source plus an optional declared form type.
//! Its SHA-256 fingerprint is the source identity used for idempotent
//! reprocessing checks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::schema::FormType;

/// Where the bytes came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DocumentSource {
    /// Loaded from a file on disk
    Path { path: PathBuf },
    /// Supplied directly by the caller (upload, stream)
    Stream { name: String },
}

impl DocumentSource {
    /// Display name, used in logs and batch failure lists
    pub fn name(&self) -> String {
        match self {
            DocumentSource::Path { path } => path.display().to_string(),
            DocumentSource::Stream { name } => name.clone(),
        }
    }

    /// Lower-cased file extension, if any
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            DocumentSource::Path { path } => path.to_string_lossy().into_owned(),
            DocumentSource::Stream { name } => name.clone(),
        };
        Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }
}

/// An ingested document. Cheap to clone; the bytes are shared.
#[derive(Debug, Clone)]
pub struct Document {
    source: DocumentSource,
    bytes: Arc<[u8]>,
    declared_form: Option<FormType>,
    fingerprint: String,
}

impl Document {
    /// Create a document from in-memory bytes
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(DocumentSource::Stream { name: name.into() }, bytes.into())
    }

    /// Read a document from disk
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(
            DocumentSource::Path {
                path: path.to_path_buf(),
            },
            bytes,
        ))
    }

    fn new(source: DocumentSource, bytes: Vec<u8>) -> Self {
        let fingerprint = hex::encode(Sha256::digest(&bytes));
        Self {
            source,
            bytes: bytes.into(),
            declared_form: None,
            fingerprint,
        }
    }

    /// Attach the form type the caller expects this document to be
    pub fn with_declared_form(mut self, form: FormType) -> Self {
        self.declared_form = Some(form);
        self
    }

    pub fn source(&self) -> &DocumentSource {
        &self.source
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn declared_form(&self) -> Option<FormType> {
        self.declared_form
    }

    /// Hex SHA-256 of the document bytes
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Serializable reference stored on the processing record
    pub fn reference(&self) -> DocumentRef {
        DocumentRef {
            source: self.source.clone(),
            fingerprint: self.fingerprint.clone(),
            size_bytes: self.bytes.len(),
            declared_form: self.declared_form,
        }
    }
}

/// What a processing record remembers about its document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub source: DocumentSource,
    pub fingerprint: String,
    pub size_bytes: usize,
    pub declared_form: Option<FormType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_content_addressed() {
        let a = Document::from_bytes("a.txt", b"Form W-2".to_vec());
        let b = Document::from_bytes("renamed.txt", b"Form W-2".to_vec());
        let c = Document::from_bytes("a.txt", b"Form 1040".to_vec());

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_extension_is_lowercased() {
        let doc = Document::from_bytes("scan.PDF", Vec::new());
        assert_eq!(doc.source().extension().as_deref(), Some("pdf"));

        let bare = Document::from_bytes("upload", Vec::new());
        assert_eq!(bare.source().extension(), None);
    }

    #[tokio::test]
    async fn test_from_path_reads_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("w2.txt");
        tokio::fs::write(&path, b"Wages: $1,000.00").await.unwrap();

        let doc = Document::from_path(&path)
            .await
            .unwrap()
            .with_declared_form(FormType::W2);

        assert_eq!(doc.bytes(), b"Wages: $1,000.00");
        assert_eq!(doc.declared_form(), Some(FormType::W2));
        assert_eq!(doc.reference().size_bytes, 16);
    }
}
