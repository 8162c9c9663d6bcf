//! HTTP client for a vision analysis endpoint
//!
//! Speaks a small JSON protocol:
//!
//! - `POST {endpoint}/v1/analyze` with
//!   `{batch_id, model, items: [{capture_id, captured_at, mime_type, data}]}`,
//!   `data` being the base64-encoded image
//! - response `{results: [{capture_id, activity_label, focus_state, context, confidence, focus_score?}]}`

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::types::{Capture, Observation};

use super::VisionAnalyzer;

/// HTTP implementation of [`VisionAnalyzer`]
pub struct HttpVisionAnalyzer {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpVisionAnalyzer {
    /// Create a client from configuration
    ///
    /// Returns an error if `analysis.endpoint` is missing or the key is not a valid header value.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let base_url = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config("analysis.endpoint is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = config.resolved_api_key() {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl VisionAnalyzer for HttpVisionAnalyzer {
    async fn submit(&self, batch_id: Uuid, captures: &[Capture]) -> Result<Vec<Observation>> {
        let url = format!("{}/v1/analyze", self.base_url);

        let items: Vec<AnalyzeItem<'_>> = captures
            .iter()
            .map(|c| AnalyzeItem {
                capture_id: c.id,
                captured_at: c.captured_at,
                mime_type: &c.mime_type,
                data: BASE64.encode(&c.payload),
            })
            .collect();

        let request_body = AnalyzeRequest {
            batch_id,
            model: &self.model,
            items,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::TransientAnalysis(format!("failed to read response: {}", e)))?;
            let parsed: AnalyzeResponse = serde_json::from_slice(&body).map_err(|e| {
                Error::PermanentAnalysis(format!("failed to parse response: {}", e))
            })?;
            Ok(parsed.results)
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(status_error(status, &error_text))
        }
    }
}

/// Request body for POST /v1/analyze
#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    batch_id: Uuid,
    model: &'a str,
    items: Vec<AnalyzeItem<'a>>,
}

#[derive(Serialize)]
struct AnalyzeItem<'a> {
    capture_id: Uuid,
    captured_at: DateTime<Utc>,
    mime_type: &'a str,
    data: String,
}

/// Response from POST /v1/analyze
#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    results: Vec<Observation>,
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_builder() {
        Error::PermanentAnalysis(format!("invalid request: {}", e))
    } else {
        Error::TransientAnalysis(format!("HTTP request failed: {}", e))
    }
}

/// Map a non-success status to the error taxonomy.
///
/// Rate limiting, request timeouts and server errors are retried; every other
/// client error (malformed batch, payload too large, auth) is not.
fn status_error(status: StatusCode, body: &str) -> Error {
    let message = format!("API error ({}): {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Error::TransientAnalysis(message)
    } else {
        Error::PermanentAnalysis(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_endpoint() {
        let config = AnalysisConfig::default();
        assert!(matches!(HttpVisionAnalyzer::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_with_valid_config() {
        let config = AnalysisConfig {
            endpoint: Some("https://vision.example.com/".to_string()),
            api_key: Some("dp_test".to_string()),
            ..Default::default()
        };
        let analyzer = HttpVisionAnalyzer::new(&config).unwrap();
        assert_eq!(analyzer.base_url, "https://vision.example.com");
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!status_error(StatusCode::PAYLOAD_TOO_LARGE, "").is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = AnalysisConfig {
            endpoint: Some(format!("http://127.0.0.1:{}", port)),
            timeout_secs: 5,
            ..Default::default()
        };
        let analyzer = HttpVisionAnalyzer::new(&config).unwrap();
        let err = analyzer.submit(Uuid::new_v4(), &[]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
