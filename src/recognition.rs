//! Recognition Adapter
//!
//! Boundary to the external OCR / text-layer service. The pipeline only
//! consumes [`RecognitionAdapter::recognize`]; engines live elsewhere.
//! [`TextLayerRecognizer`] reads text layers that were already produced
//! (plain text or serialized blocks) so the pipeline can run locally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Document;

/// Recognition failures. All are local to one document.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecognitionError {
    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("Corrupt document: {0}")]
    Corrupt(String),

    #[error("Document has no recognizable text")]
    Empty,

    #[error("Recognition engine failed: {0}")]
    Engine(String),
}

/// Bounding box of a recognized block, in page units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One block of recognized text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedBlock {
    pub text: String,
    pub bounds: BoundingBox,
    /// Zero-based page index
    pub page: u32,
    /// Recognition confidence in [0, 1]
    pub confidence: f64,
}

impl RecognizedBlock {
    pub fn new(text: impl Into<String>, page: u32, bounds: BoundingBox, confidence: f64) -> Self {
        Self {
            text: text.into(),
            bounds,
            page,
            confidence,
        }
    }
}

/// Pointer from an entity span back to the block it was read from.
/// Carries the block position so proximity can be judged without the blocks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub index: usize,
    pub page: u32,
    pub x: f64,
    pub y: f64,
}

/// Distance penalty for each page separating two blocks
const PAGE_DISTANCE: f64 = 1_000_000.0;

impl BlockRef {
    /// Spatial distance between two blocks; blocks on other pages are far away
    pub fn distance(&self, other: &BlockRef) -> f64 {
        let page_gap = f64::from(self.page.abs_diff(other.page)) * PAGE_DISTANCE;
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        page_gap + (dx * dx + dy * dy).sqrt()
    }
}

/// Byte range of one block inside the concatenated text
#[derive(Debug, Clone)]
struct BlockSpan {
    block: BlockRef,
    start: usize,
    end: usize,
}

/// Concatenated recognized text in reading order (page, top, left), with a map
/// from text offsets back to blocks.
#[derive(Debug, Clone)]
pub struct TextLayer {
    text: String,
    spans: Vec<BlockSpan>,
}

impl TextLayer {
    pub fn from_blocks(blocks: &[RecognizedBlock]) -> Self {
        let mut order: Vec<usize> = (0..blocks.len()).collect();
        order.sort_by(|&a, &b| {
            let (ba, bb) = (&blocks[a], &blocks[b]);
            ba.page
                .cmp(&bb.page)
                .then(ba.bounds.y.total_cmp(&bb.bounds.y))
                .then(ba.bounds.x.total_cmp(&bb.bounds.x))
        });

        let mut text = String::new();
        let mut spans = Vec::with_capacity(blocks.len());
        for index in order {
            let block = &blocks[index];
            if !text.is_empty() {
                text.push('\n');
            }
            let start = text.len();
            text.push_str(&block.text);
            let (x, y) = block.bounds.center();
            spans.push(BlockSpan {
                block: BlockRef {
                    index,
                    page: block.page,
                    x,
                    y,
                },
                start,
                end: text.len(),
            });
        }

        Self { text, spans }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Block containing the given byte offset
    pub fn block_at(&self, offset: usize) -> Option<BlockRef> {
        self.spans
            .iter()
            .find(|s| offset >= s.start && offset < s.end.max(s.start + 1))
            .map(|s| s.block)
    }
}

/// Aggregate numbers about a recognition pass, kept on the record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionSummary {
    pub engine: String,
    /// Entity extraction model that read the text layer
    #[serde(default)]
    pub extractor: String,
    pub pages: usize,
    pub blocks: usize,
    pub text_length: usize,
    /// Mean block confidence weighted by block text length
    pub weighted_confidence: f64,
    pub entities_found: usize,
}

impl RecognitionSummary {
    pub fn from_blocks(
        engine: &str,
        extractor: &str,
        blocks: &[RecognizedBlock],
        entities_found: usize,
    ) -> Self {
        let mut pages: Vec<u32> = blocks.iter().map(|b| b.page).collect();
        pages.sort_unstable();
        pages.dedup();

        Self {
            engine: engine.to_string(),
            extractor: extractor.to_string(),
            pages: pages.len(),
            blocks: blocks.len(),
            text_length: blocks.iter().map(|b| b.text.chars().count()).sum(),
            weighted_confidence: weighted_confidence(blocks),
            entities_found,
        }
    }
}

/// Mean confidence weighted by character count. Zero when there is no text.
pub fn weighted_confidence(blocks: &[RecognizedBlock]) -> f64 {
    let (weighted, total) = blocks.iter().fold((0.0, 0usize), |(w, t), b| {
        let len = b.text.chars().count();
        (w + b.confidence.clamp(0.0, 1.0) * len as f64, t + len)
    });
    if total == 0 {
        0.0
    } else {
        weighted / total as f64
    }
}

/// External OCR boundary
#[async_trait]
pub trait RecognitionAdapter: Send + Sync {
    /// Recognize a document into positioned text blocks
    async fn recognize(&self, document: &Document)
        -> Result<Vec<RecognizedBlock>, RecognitionError>;

    /// Engine name recorded on the processing record
    fn engine_name(&self) -> &'static str;
}

/// Line height used when laying out plain-text lines as blocks
const LINE_HEIGHT: f64 = 12.0;
/// Character width used when laying out plain-text lines as blocks
const CHAR_WIDTH: f64 = 6.0;

/// Reads pre-recognized text layers.
///
/// - `.txt`: one block per non-empty line, form feed starts a new page
/// - `.json`: a serialized `Vec<RecognizedBlock>`
#[derive(Debug, Clone)]
pub struct TextLayerRecognizer {
    plain_text_confidence: f64,
}

impl TextLayerRecognizer {
    pub fn new(plain_text_confidence: f64) -> Self {
        Self {
            plain_text_confidence: plain_text_confidence.clamp(0.0, 1.0),
        }
    }

    fn recognize_plain_text(&self, bytes: &[u8]) -> Result<Vec<RecognizedBlock>, RecognitionError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RecognitionError::Corrupt(format!("text layer is not UTF-8: {e}")))?;

        let mut blocks = Vec::new();
        for (page, page_text) in text.split('\x0c').enumerate() {
            for (line_no, line) in page_text.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let indent = line.len() - line.trim_start().len();
                blocks.push(RecognizedBlock::new(
                    trimmed,
                    page as u32,
                    BoundingBox {
                        x: indent as f64 * CHAR_WIDTH,
                        y: line_no as f64 * LINE_HEIGHT,
                        width: trimmed.chars().count() as f64 * CHAR_WIDTH,
                        height: LINE_HEIGHT,
                    },
                    self.plain_text_confidence,
                ));
            }
        }
        Ok(blocks)
    }

    fn recognize_json(&self, bytes: &[u8]) -> Result<Vec<RecognizedBlock>, RecognitionError> {
        let blocks: Vec<RecognizedBlock> = serde_json::from_slice(bytes)
            .map_err(|e| RecognitionError::Corrupt(format!("invalid text layer JSON: {e}")))?;

        if let Some(bad) = blocks
            .iter()
            .find(|b| !(0.0..=1.0).contains(&b.confidence))
        {
            return Err(RecognitionError::Corrupt(format!(
                "block confidence {} outside [0, 1]",
                bad.confidence
            )));
        }
        Ok(blocks)
    }
}

impl Default for TextLayerRecognizer {
    fn default() -> Self {
        Self::new(0.99)
    }
}

#[async_trait]
impl RecognitionAdapter for TextLayerRecognizer {
    async fn recognize(
        &self,
        document: &Document,
    ) -> Result<Vec<RecognizedBlock>, RecognitionError> {
        let blocks = match document.source().extension().as_deref() {
            Some("txt") | Some("text") => self.recognize_plain_text(document.bytes())?,
            Some("json") => self.recognize_json(document.bytes())?,
            Some(other) => {
                return Err(RecognitionError::UnsupportedType(format!(
                    ".{other} needs an OCR engine"
                )))
            }
            None => return Err(RecognitionError::UnsupportedType("no extension".to_string())),
        };

        if blocks.iter().all(|b| b.text.trim().is_empty()) {
            return Err(RecognitionError::Empty);
        }
        Ok(blocks)
    }

    fn engine_name(&self) -> &'static str {
        "text-layer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str, page: u32, x: f64, y: f64, confidence: f64) -> RecognizedBlock {
        RecognizedBlock::new(
            text,
            page,
            BoundingBox {
                x,
                y,
                width: 10.0,
                height: 10.0,
            },
            confidence,
        )
    }

    #[test]
    fn test_text_layer_reading_order() {
        let blocks = vec![
            block("second page", 1, 0.0, 0.0, 1.0),
            block("bottom", 0, 0.0, 50.0, 1.0),
            block("top right", 0, 40.0, 0.0, 1.0),
            block("top left", 0, 0.0, 0.0, 1.0),
        ];
        let layer = TextLayer::from_blocks(&blocks);

        assert_eq!(layer.text(), "top left\ntop right\nbottom\nsecond page");
        assert_eq!(layer.block_at(0).map(|b| b.index), Some(3));
        assert_eq!(layer.block_at(9).map(|b| b.index), Some(2));
        assert_eq!(layer.block_at(layer.text().len() - 1).map(|b| b.page), Some(1));
        assert!(layer.block_at(10_000).is_none());
    }

    #[test]
    fn test_weighted_confidence_by_length() {
        let blocks = vec![
            block("aaaaaaaaa", 0, 0.0, 0.0, 1.0),
            block("b", 0, 0.0, 10.0, 0.0),
        ];
        assert!((weighted_confidence(&blocks) - 0.9).abs() < 1e-9);
        assert_eq!(weighted_confidence(&[]), 0.0);
    }

    #[test]
    fn test_block_distance_prefers_same_page() {
        let a = BlockRef { index: 0, page: 0, x: 0.0, y: 0.0 };
        let b = BlockRef { index: 1, page: 0, x: 3.0, y: 4.0 };
        let c = BlockRef { index: 2, page: 1, x: 0.0, y: 0.0 };
        assert_eq!(a.distance(&b), 5.0);
        assert!(a.distance(&c) > a.distance(&b));
    }

    #[tokio::test]
    async fn test_plain_text_layer_pages() {
        let doc = Document::from_bytes("form.txt", b"Form W-2\n\n  Wages: $10\x0cPage two".to_vec());
        let blocks = TextLayerRecognizer::new(0.9).recognize(&doc).await.unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].text, "Wages: $10");
        assert_eq!(blocks[1].bounds.x, 2.0 * CHAR_WIDTH);
        assert_eq!(blocks[2].page, 1);
        assert!(blocks.iter().all(|b| b.confidence == 0.9));
    }

    #[tokio::test]
    async fn test_json_layer_roundtrip() {
        let original = vec![block("Form 1040", 0, 0.0, 0.0, 0.8)];
        let doc = Document::from_bytes("scan.json", serde_json::to_vec(&original).unwrap());
        let blocks = TextLayerRecognizer::default().recognize(&doc).await.unwrap();
        assert_eq!(blocks, original);
    }

    #[tokio::test]
    async fn test_recognition_failures() {
        let recognizer = TextLayerRecognizer::default();

        let pdf = Document::from_bytes("scan.pdf", b"%PDF-1.7".to_vec());
        assert!(matches!(
            recognizer.recognize(&pdf).await,
            Err(RecognitionError::UnsupportedType(_))
        ));

        let binary = Document::from_bytes("scan.txt", vec![0xff, 0xfe, 0x00]);
        assert!(matches!(
            recognizer.recognize(&binary).await,
            Err(RecognitionError::Corrupt(_))
        ));

        let blank = Document::from_bytes("blank.txt", b"  \n\n".to_vec());
        assert_eq!(recognizer.recognize(&blank).await, Err(RecognitionError::Empty));

        let bad_conf = Document::from_bytes(
            "bad.json",
            serde_json::to_vec(&vec![block("x", 0, 0.0, 0.0, 1.5)]).unwrap(),
        );
        assert!(matches!(
            recognizer.recognize(&bad_conf).await,
            Err(RecognitionError::Corrupt(_))
        ));
    }
}
