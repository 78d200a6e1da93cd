//! HTTP transport for the request/response service.
//!
//! Requests are `POST {base_url}/responses`.  A blocking request returns the
//! response object; a streaming request returns `text/event-stream` decoded
//! by [`decode_stream`](super::sse::decode_stream).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};

use turnloop_protocol::{Response, ResponseRequest, ServiceError};

use crate::config::AgentSettings;
use crate::error::{AgentError, Result};
use crate::transport::sse::decode_stream;
use crate::transport::{ResponsesTransport, ServerEventStream};

/// Error body returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ServiceError,
}

/// [`ResponsesTransport`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Build a transport from settings.  Fails when no API key is set.
    pub fn from_settings(settings: &AgentSettings) -> Result<Self> {
        Self::new(
            settings.base_url.clone(),
            settings.require_api_key()?,
            Duration::from_secs(settings.connect_timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url.trim_end_matches('/'))
    }

    fn request_body(request: &ResponseRequest, stream: bool) -> Result<Value> {
        let mut body = serde_json::to_value(request)?;
        body["stream"] = json!(stream);
        Ok(body)
    }

    async fn post(&self, body: &Value, stream: bool) -> Result<reqwest::Response> {
        let url = self.endpoint();

        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| AgentError::Config {
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        tracing::debug!(url = %url, model = %body["model"], stream, "sending response request");

        let resp = self.http.post(&url).headers(headers).json(body).send().await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        Err(error_from_body(status, &text))
    }
}

/// Map a non-2xx body to a service error when it carries one.
fn error_from_body(status: reqwest::StatusCode, text: &str) -> AgentError {
    match serde_json::from_str::<ErrorEnvelope>(text) {
        Ok(envelope) => {
            tracing::warn!(%status, code = ?envelope.error.code, "service rejected request");
            AgentError::from(envelope.error)
        }
        Err(_) => AgentError::Transport {
            reason: format!("API returned {status}: {text}"),
        },
    }
}

#[async_trait]
impl ResponsesTransport for HttpTransport {
    async fn create_response(&self, request: &ResponseRequest) -> Result<Response> {
        let body = Self::request_body(request, false)?;
        let resp = self.post(&body, false).await?;

        let text = resp.text().await?;
        let response: Response = serde_json::from_str(&text)?;
        tracing::debug!(response_id = %response.id, status = ?response.status, "response received");
        Ok(response)
    }

    async fn stream_response(&self, request: &ResponseRequest) -> Result<ServerEventStream> {
        let body = Self::request_body(request, true)?;
        let resp = self.post(&body, true).await?;
        Ok(decode_stream(resp.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloop_protocol::ConversationItem;

    #[test]
    fn endpoint_trims_trailing_slash() {
        let transport =
            HttpTransport::new("https://example.test/v1/", "k", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.endpoint(), "https://example.test/v1/responses");
    }

    #[test]
    fn body_carries_stream_flag() {
        let request = ResponseRequest {
            model: "m".into(),
            input: vec![ConversationItem::user_text("hi")],
            ..ResponseRequest::default()
        };

        let body = HttpTransport::request_body(&request, true).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["model"], json!("m"));

        let body = HttpTransport::request_body(&request, false).unwrap();
        assert_eq!(body["stream"], json!(false));
    }

    #[test]
    fn error_body_becomes_service_error() {
        let text = r#"{"error":{"type":"invalid_request_error","code":"model_not_found","message":"no such model","param":"model"}}"#;
        let err = error_from_body(reqwest::StatusCode::NOT_FOUND, text);
        match err {
            AgentError::Service {
                code,
                message,
                param,
            } => {
                assert_eq!(code.as_deref(), Some("model_not_found"));
                assert_eq!(message, "no such model");
                assert_eq!(param.as_deref(), Some("model"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn opaque_body_becomes_transport_error() {
        let err = error_from_body(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert!(matches!(err, AgentError::Transport { .. }));
    }

    #[test]
    fn from_settings_requires_key() {
        let settings = AgentSettings::default();
        assert!(matches!(
            HttpTransport::from_settings(&settings),
            Err(AgentError::Config { .. })
        ));
    }
}
