//! REST transport for the Opik ingestion API.
//!
//! One request per batch, no retries: the status code is classified and handed back to the
//! dispatcher.
//!
//! | stream | method | path | body |
//! |---|---|---|---|
//! | trace | POST | `/v1/private/traces/batch` | `{"traces": [...]}` |
//! | span | POST | `/v1/private/spans/batch` | `{"spans": [...]}` |
//! | trace feedback score | PUT | `/v1/private/traces/feedback-scores` | `{"scores": [...]}` |
//! | span feedback score | PUT | `/v1/private/spans/feedback-scores` | `{"scores": [...]}` |

use crate::batch::Batch;
use crate::error::{ConfigError, TransportError};
use crate::event::StreamKind;
use crate::settings::Settings;
use crate::transport::Transport;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};

const WORKSPACE_HEADER: &str = "comet-workspace";

fn route(stream: StreamKind) -> (Method, &'static str, &'static str) {
    match stream {
        StreamKind::Trace => (Method::POST, "/v1/private/traces/batch", "traces"),
        StreamKind::Span => (Method::POST, "/v1/private/spans/batch", "spans"),
        StreamKind::TraceFeedbackScore => {
            (Method::PUT, "/v1/private/traces/feedback-scores", "scores")
        }
        StreamKind::SpanFeedbackScore => {
            (Method::PUT, "/v1/private/spans/feedback-scores", "scores")
        }
    }
}

/// Map an HTTP status to a delivery outcome.
///
/// 2xx is success. 408, 429 and 5xx are transient. Anything else (validation errors,
/// auth failures, unknown routes) will not succeed on resubmission.
pub fn classify_status(status: StatusCode) -> Result<(), TransportError> {
    match status.as_u16() {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(TransportError::retryable(status.to_string())),
        _ => Err(TransportError::permanent(status.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<&str>,
        workspace: &str,
    ) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let mut value = HeaderValue::from_str(key)
                .map_err(|_| ConfigError::InvalidValue("api key is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let workspace = HeaderValue::from_str(workspace)
            .map_err(|_| ConfigError::InvalidValue("workspace is not a valid header value".into()))?;
        headers.insert(WORKSPACE_HEADER, workspace);

        // Submit deadlines are enforced by the dispatcher, not here.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidValue(format!("http client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::new(&settings.url, settings.api_key.as_deref(), &settings.workspace)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

pub(crate) fn request_body(batch: &Batch) -> Value {
    let (_, _, key) = route(batch.stream());
    let mut body = Map::new();
    body.insert(key.to_string(), Value::Array(batch.payloads().cloned().collect()));
    Value::Object(body)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, batch: &Batch) -> Result<(), TransportError> {
        let (method, path, _) = route(batch.stream());
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .request(method, &url)
            .json(&request_body(batch))
            .send()
            .await
            // Connect failures, resets and client-side timeouts are all transient.
            .map_err(|e| TransportError::retryable(e.to_string()))?;

        let status = response.status();
        let outcome = classify_status(status);
        if outcome.is_err() {
            let detail = response.text().await.unwrap_or_default();
            tracing::debug!(stream = %batch.stream(), %status, %detail, "ingestion request rejected");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;
    use serde_json::json;

    #[test]
    fn success_statuses() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT).is_ok());
    }

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(classify_status(status).unwrap_err().is_retryable(), "{status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::CONFLICT,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            let err = classify_status(status).unwrap_err();
            assert!(!err.is_retryable(), "{status}");
            assert!(err.to_string().contains(status.as_str()));
        }
    }

    #[test]
    fn routes_per_stream() {
        assert_eq!(route(StreamKind::Trace).1, "/v1/private/traces/batch");
        assert_eq!(route(StreamKind::Span).0, Method::POST);
        assert_eq!(route(StreamKind::SpanFeedbackScore).0, Method::PUT);
        assert_eq!(route(StreamKind::TraceFeedbackScore).1, "/v1/private/traces/feedback-scores");
    }

    #[test]
    fn body_wraps_payloads_under_stream_key() {
        let records = vec![
            (1, EventRecord::new(StreamKind::Span, "a", json!({ "id": "a" }))),
            (2, EventRecord::new(StreamKind::Span, "b", json!({ "id": "b" }))),
        ];
        let body = request_body(&Batch::new(StreamKind::Span, records));
        assert_eq!(body, json!({ "spans": [{ "id": "a" }, { "id": "b" }] }));
    }

    #[test]
    fn builds_from_settings_and_trims_url() {
        let settings = Settings::builder()
            .env(|_| None)
            .url("http://localhost:5173/api/")
            .api_key("secret")
            .resolve()
            .unwrap();
        let transport = HttpTransport::from_settings(&settings).unwrap();
        assert_eq!(transport.base_url(), "http://localhost:5173/api");
    }

    #[test]
    fn rejects_invalid_header_values() {
        assert!(HttpTransport::new("http://x", Some("bad\nkey"), "ws").is_err());
    }
}
