//! Shared fixtures for pipeline integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use taxform_pipeline::entity::{EntityExtractor, EntitySpan, PatternEntityExtractor};
use taxform_pipeline::pipeline::PipelineBuilder;
use taxform_pipeline::recognition::{
    BoundingBox, RecognitionAdapter, RecognitionError, RecognizedBlock, TextLayerRecognizer,
};
use taxform_pipeline::submission::{
    StatusResponse, SubmissionPayload, SubmissionTransport, TransportResponse,
};
use taxform_pipeline::{Document, Pipeline, PipelineConfig};

pub const CLEAN_W2: &str = "Form W-2 Wage and Tax Statement\n\
Tax year: 2023\n\
Employer name: Acme Manufacturing Inc\n\
Employer identification number: 12-3456789\n\
Employee's name: Jane Q Public\n\
Employee's social security number: 987-65-4321\n\
Wages, tips, other compensation: $52,000.00\n\
Federal income tax withheld: $6,100.00\n\
Social security wages: $52,000.00\n";

pub const F1040_WITHOUT_TOTAL: &str = "Form 1040 U.S. Individual Income Tax Return\n\
Tax year: 2023\n\
Name: John A Smith\n\
Social security number: 987-65-4320\n\
Filing status: Single\n\
Wages: $50,000.00\n";

pub const NOISE: &str = "Grocery list\nEggs, milk, bread\nCall the plumber on Tuesday\n";

pub fn w2_document() -> Document {
    Document::from_bytes("w2.txt", CLEAN_W2)
}

pub fn text_document(name: &str, text: &str) -> Document {
    Document::from_bytes(name, text)
}

/// Builder over the plain-text recognizer and pattern extractor
pub fn builder() -> PipelineBuilder {
    builder_with(Arc::new(TextLayerRecognizer::default()))
}

pub fn builder_with(recognizer: Arc<dyn RecognitionAdapter>) -> PipelineBuilder {
    Pipeline::builder(recognizer, Arc::new(PatternEntityExtractor::new()))
}

/// Fast retry schedule so paused-clock tests stay short
pub fn quick_retry_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.max_attempts = 4;
    config.retry.initial_backoff_ms = 100;
    config.retry.max_backoff_ms = 1_000;
    config.retry.send_timeout_ms = 1_000;
    config
}

/// Recognizer answering every document with the same result
pub struct FixedRecognizer {
    result: Result<Vec<RecognizedBlock>, RecognitionError>,
}

impl FixedRecognizer {
    pub fn blocks(blocks: Vec<RecognizedBlock>) -> Self {
        Self { result: Ok(blocks) }
    }

    pub fn error(error: RecognitionError) -> Self {
        Self { result: Err(error) }
    }

    /// One block per line, all at the given confidence
    pub fn lines(text: &str, confidence: f64) -> Self {
        let blocks = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                RecognizedBlock::new(
                    line.trim(),
                    0,
                    BoundingBox {
                        x: 0.0,
                        y: i as f64 * 12.0,
                        width: line.len() as f64 * 6.0,
                        height: 12.0,
                    },
                    confidence,
                )
            })
            .collect();
        Self::blocks(blocks)
    }
}

#[async_trait]
impl RecognitionAdapter for FixedRecognizer {
    async fn recognize(&self, _document: &Document) -> Result<Vec<RecognizedBlock>, RecognitionError> {
        self.result.clone()
    }

    fn engine_name(&self) -> &'static str {
        "fixed"
    }
}

/// Recognizer that never answers within any sensible timeout
pub struct SlowRecognizer {
    pub delay: Duration,
}

#[async_trait]
impl RecognitionAdapter for SlowRecognizer {
    async fn recognize(&self, _document: &Document) -> Result<Vec<RecognizedBlock>, RecognitionError> {
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }

    fn engine_name(&self) -> &'static str {
        "slow"
    }
}

/// Extractor that outlasts any stage timeout
pub struct SlowExtractor {
    pub delay: Duration,
}

#[async_trait]
impl EntityExtractor for SlowExtractor {
    async fn extract(&self, _text: &str) -> Vec<EntitySpan> {
        tokio::time::sleep(self.delay).await;
        Vec::new()
    }

    fn model_name(&self) -> &'static str {
        "slow"
    }
}

/// Plain-text recognizer that panics on documents whose name contains "panic"
pub struct PanickyRecognizer {
    inner: TextLayerRecognizer,
}

impl PanickyRecognizer {
    pub fn new() -> Self {
        Self {
            inner: TextLayerRecognizer::default(),
        }
    }
}

#[async_trait]
impl RecognitionAdapter for PanickyRecognizer {
    async fn recognize(&self, document: &Document) -> Result<Vec<RecognizedBlock>, RecognitionError> {
        if document.source().name().contains("panic") {
            panic!("recognition engine crashed");
        }
        self.inner.recognize(document).await
    }

    fn engine_name(&self) -> &'static str {
        "panicky"
    }
}

/// Transport replaying scripted answers. The last send answer repeats once the
/// script runs out; status queries default to `Pending`.
pub struct ScriptedTransport {
    sends: Mutex<VecDeque<TransportResponse>>,
    last_send: Mutex<TransportResponse>,
    statuses: Mutex<VecDeque<StatusResponse>>,
    send_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(sends: Vec<TransportResponse>) -> Arc<Self> {
        Self::with_statuses(sends, Vec::new())
    }

    pub fn with_statuses(sends: Vec<TransportResponse>, statuses: Vec<StatusResponse>) -> Arc<Self> {
        let last_send = sends
            .last()
            .cloned()
            .unwrap_or_else(|| transient("no script"));
        Arc::new(Self {
            sends: Mutex::new(sends.into()),
            last_send: Mutex::new(last_send),
            statuses: Mutex::new(statuses.into()),
            send_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        })
    }

    pub fn accepting(reference_id: &str) -> Arc<Self> {
        Self::new(vec![accepted(reference_id)])
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubmissionTransport for ScriptedTransport {
    async fn send(&self, _payload: &SubmissionPayload) -> TransportResponse {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.sends.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.last_send.lock().unwrap().clone())
    }

    async fn status(&self, _reference_id: &str) -> StatusResponse {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StatusResponse::Pending)
    }
}

pub fn accepted(reference_id: &str) -> TransportResponse {
    TransportResponse::Accepted {
        reference_id: reference_id.to_string(),
    }
}

pub fn rejected(reason: &str) -> TransportResponse {
    TransportResponse::Rejected {
        reason: reason.to_string(),
    }
}

pub fn transient(reason: &str) -> TransportResponse {
    TransportResponse::TransientError {
        reason: reason.to_string(),
    }
}

/// One request seen by a [`StubEndpoint`]
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Lowercased names
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Local HTTP server answering every request with the same raw reply
pub struct StubEndpoint {
    pub base_url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl StubEndpoint {
    pub async fn answering(reply: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut socket).await {
                        seen.lock().unwrap().push(request);
                    }
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests().iter().filter(|r| r.method == method).count()
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(key, _)| key == "content-length")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(CapturedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
    })
}
