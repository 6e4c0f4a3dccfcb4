//! HTTP Submission Transport
//!
//! JSON over HTTP against an e-filing endpoint:
//!
//! - `POST {base}/submissions` with the payload, answering `{"reference_id": ...}`
//! - `GET {base}/submissions/{reference_id}`, answering
//!   `{"status": "pending" | "accepted" | "rejected", "reason": ...}`
//!
//! 2xx is success, 4xx a rejection (408 and 429 excepted), 5xx, timeouts and
//! connection errors are transient. A 2xx is final even when the receipt
//! body is not the expected JSON: the reference then falls back to the
//! `Location` header, then the raw body. Retrying it would file twice.
//!
//! With an API key configured every request carries `Authorization: Bearer`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, LOCATION};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::submission::{StatusResponse, SubmissionPayload, SubmissionTransport, TransportResponse};

/// How an HTTP status is treated by the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Rejected,
    Transient,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::Transient
    } else if status.is_client_error() {
        StatusClass::Rejected
    } else {
        StatusClass::Transient
    }
}

#[derive(Debug, Deserialize)]
struct Receipt {
    reference_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Longest raw body accepted as a fallback reference
const MAX_RAW_REFERENCE: usize = 128;

pub struct HttpSubmissionTransport {
    http: Client,
    base: Url,
}

impl HttpSubmissionTransport {
    pub fn new(base_url: &str, timeout: Duration, api_key: Option<&str>) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid submission endpoint '{}'", base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Submission endpoint '{}' cannot carry a path", base_url);
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .context("Submission API key is not a valid header value")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("taxform-pipeline/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { http, base })
    }

    /// Base URL extended by percent-encoded path segments
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn transient(err: reqwest::Error) -> String {
        if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        }
    }
}

#[async_trait]
impl SubmissionTransport for HttpSubmissionTransport {
    async fn send(&self, payload: &SubmissionPayload) -> TransportResponse {
        let url = self.endpoint(&["submissions"]);
        let response = match self.http.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(e) => {
                return TransportResponse::TransientError {
                    reason: Self::transient(e),
                }
            }
        };

        let status = response.status();
        match classify_status(status) {
            StatusClass::Success => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let body = response.text().await.unwrap_or_default();
                let reference_id = reference_from_reply(&body, location.as_deref())
                    .unwrap_or_else(|| {
                        tracing::warn!(%status, "Endpoint accepted without a usable reference");
                        format!("HTTP {}", status.as_u16())
                    });
                TransportResponse::Accepted { reference_id }
            }
            StatusClass::Rejected => {
                let body = response.text().await.unwrap_or_default();
                TransportResponse::Rejected {
                    reason: format!("{}: {}", status, body.trim()),
                }
            }
            StatusClass::Transient => TransportResponse::TransientError {
                reason: status.to_string(),
            },
        }
    }

    async fn status(&self, reference_id: &str) -> StatusResponse {
        let url = self.endpoint(&["submissions", reference_id]);
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return StatusResponse::TransientError {
                    reason: Self::transient(e),
                }
            }
        };

        let status = response.status();
        if classify_status(status) != StatusClass::Success {
            return StatusResponse::TransientError {
                reason: format!("status query returned {}", status),
            };
        }

        match response.json::<StatusBody>().await {
            Ok(body) => parse_status(body),
            Err(e) => StatusResponse::TransientError {
                reason: format!("unreadable status: {}", e),
            },
        }
    }
}

/// Reference from a 2xx reply: JSON receipt, else `Location`, else raw body
fn reference_from_reply(body: &str, location: Option<&str>) -> Option<String> {
    if let Ok(receipt) = serde_json::from_str::<Receipt>(body) {
        if !receipt.reference_id.trim().is_empty() {
            return Some(receipt.reference_id);
        }
    }

    let from_location = location
        .map(|l| l.trim_end_matches('/'))
        .and_then(|l| l.rsplit('/').next())
        .filter(|segment| !segment.is_empty());
    if let Some(segment) = from_location {
        return Some(segment.to_string());
    }

    let raw = body.trim();
    (!raw.is_empty() && raw.len() <= MAX_RAW_REFERENCE && !raw.contains('\n'))
        .then(|| raw.to_string())
}

fn parse_status(body: StatusBody) -> StatusResponse {
    match body.status.to_ascii_lowercase().as_str() {
        "accepted" => StatusResponse::Accepted,
        "rejected" => StatusResponse::Rejected {
            reason: body.reason.unwrap_or_else(|| "rejected by endpoint".to_string()),
        },
        "pending" | "received" | "processing" => StatusResponse::Pending,
        other => StatusResponse::TransientError {
            reason: format!("unknown status '{}'", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::CREATED), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), StatusClass::Rejected);
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            StatusClass::Rejected
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            StatusClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            StatusClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            StatusClass::Transient
        );
    }

    #[test]
    fn test_parse_status_body() {
        let body: StatusBody =
            serde_json::from_str(r#"{"status": "REJECTED", "reason": "R0000-504"}"#).unwrap();
        assert_eq!(
            parse_status(body),
            StatusResponse::Rejected {
                reason: "R0000-504".to_string()
            }
        );

        let body: StatusBody = serde_json::from_str(r#"{"status": "pending"}"#).unwrap();
        assert_eq!(parse_status(body), StatusResponse::Pending);
    }

    #[test]
    fn test_reference_from_reply_fallbacks() {
        assert_eq!(
            reference_from_reply(r#"{"reference_id": "EF-9"}"#, Some("/submissions/X")),
            Some("EF-9".to_string())
        );
        assert_eq!(
            reference_from_reply("<html>created</html>", Some("/api/submissions/EF-10/")),
            Some("EF-10".to_string())
        );
        assert_eq!(reference_from_reply(" ok\n", None), Some("ok".to_string()));
        assert_eq!(reference_from_reply("", None), None);
        assert_eq!(reference_from_reply("line one\nline two", None), None);
    }

    #[test]
    fn test_reference_is_encoded_as_one_segment() {
        let transport =
            HttpSubmissionTransport::new("http://localhost/api/", Duration::from_secs(1), None)
                .unwrap();
        assert_eq!(
            transport.endpoint(&["submissions"]).as_str(),
            "http://localhost/api/submissions"
        );
        assert_eq!(
            transport.endpoint(&["submissions", "A/B ?x#y"]).path(),
            "/api/submissions/A%2FB%20%3Fx%23y"
        );

        let bare = HttpSubmissionTransport::new("http://localhost", Duration::from_secs(1), None)
            .unwrap();
        assert_eq!(bare.endpoint(&["submissions"]).path(), "/submissions");
    }

    #[test]
    fn test_rejects_unusable_endpoint() {
        assert!(HttpSubmissionTransport::new("not a url", Duration::from_secs(1), None).is_err());
        assert!(HttpSubmissionTransport::new("mailto:a@b", Duration::from_secs(1), None).is_err());
        assert!(HttpSubmissionTransport::new(
            "http://localhost",
            Duration::from_secs(1),
            Some("bad\nkey")
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let transport =
            HttpSubmissionTransport::new("http://127.0.0.1:9/", Duration::from_millis(500), None)
                .unwrap();
        assert!(matches!(
            transport.status("EF-1").await,
            StatusResponse::TransientError { .. }
        ));
    }
}
