//! HTTP model backend.
//!
//! Implements [`ModelBackend`] over a JSON completion endpoint
//! (`POST {base_url}/v1/complete`). The confidential system policy travels in
//! its own field, separate from the conversation, and an optional JSON schema
//! asks the backend for structured output.
//!
//! Connection failures, timeouts, 429 and 5xx responses are reported as
//! [`WardenError::BackendUnavailable`]; other failures as
//! [`WardenError::Model`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use warden_types::actions::{ChatMessage, ChatRole, ModelRequest, ModelResponse, TokenUsage};
use warden_types::errors::WardenError;
use warden_types::traits::ModelBackend;

/// Connection settings for [`HttpModelBackend`].
#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    /// Base URL, without the `/v1/complete` path.
    pub base_url: String,
    /// Model name sent with every request.
    pub model: String,
    /// Bearer token, if the endpoint needs one.
    pub api_key: Option<String>,
    /// Hard limit on one request, connect to last byte.
    pub timeout: Duration,
}

impl HttpModelConfig {
    /// Settings with no API key and a 30 second timeout.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

// -- Wire types --

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    text: String,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Model backend speaking the JSON completion protocol.
pub struct HttpModelBackend {
    client: Client,
    config: HttpModelConfig,
}

impl HttpModelBackend {
    /// Build a backend; the timeout is applied to every request.
    pub fn new(config: HttpModelConfig) -> Result<Self, WardenError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WardenError::Model(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/complete", self.config.base_url.trim_end_matches('/'))
    }

    fn convert_messages<'a>(history: &'a [ChatMessage], user_turn: &'a str) -> Vec<WireMessage<'a>> {
        history
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                },
                content: &m.content,
            })
            .chain(std::iter::once(WireMessage {
                role: "user",
                content: user_turn,
            }))
            .collect()
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, WardenError> {
        let body = CompleteRequest {
            model: &self.config.model,
            system: &request.system_policy,
            messages: Self::convert_messages(&request.history, &request.user_turn),
            max_tokens: request.max_tokens,
            response_schema: request.response_schema.as_ref(),
        };

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(request_id = %request.request_id, timeout = e.is_timeout(), "model request failed");
            WardenError::BackendUnavailable(format!("model request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(request_id = %request.request_id, %status, "model backend returned error status");
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(WardenError::BackendUnavailable(format!(
                    "model backend HTTP {status}: {body}"
                )));
            }
            return Err(WardenError::Model(format!("model backend HTTP {status}: {body}")));
        }

        let parsed: CompleteResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                WardenError::BackendUnavailable(format!("model response timed out: {e}"))
            } else {
                WardenError::Model(format!("failed to parse model response: {e}"))
            }
        })?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();
        debug!(
            request_id = %request.request_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "model call completed"
        );

        Ok(ModelResponse {
            text: parsed.text,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> ModelRequest {
        ModelRequest {
            request_id: Uuid::new_v4(),
            system_policy: "You are the order support assistant.".to_string(),
            history: vec![ChatMessage {
                role: ChatRole::Assistant,
                content: "How can I help?".to_string(),
            }],
            user_turn: "Where is order 8841?".to_string(),
            response_schema: None,
            max_tokens: 256,
        }
    }

    fn backend(server: &MockServer) -> HttpModelBackend {
        HttpModelBackend::new(HttpModelConfig::new(server.uri(), "support-model")).unwrap()
    }

    #[test]
    fn test_message_conversion_appends_user_turn() {
        let request = sample_request();
        let messages = HttpModelBackend::convert_messages(&request.history, &request.user_turn);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "Where is order 8841?");
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .and(body_partial_json(serde_json::json!({
                "model": "support-model",
                "system": "You are the order support assistant.",
                "max_tokens": 256
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "Order 8841 shipped Monday.",
                "usage": { "input_tokens": 40, "output_tokens": 7 }
            })))
            .mount(&server)
            .await;

        let response = backend(&server).complete(sample_request()).await.unwrap();
        assert_eq!(response.text, "Order 8841 shipped Monday.");
        assert_eq!(response.usage.total(), 47);
    }

    #[tokio::test]
    async fn test_bearer_token_and_schema_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "response_schema": { "type": "object" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "{}"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = HttpModelConfig::new(server.uri(), "support-model");
        config.api_key = Some("sk-test".to_string());
        let backend = HttpModelBackend::new(config).unwrap();

        let mut request = sample_request();
        request.response_schema = Some(serde_json::json!({ "type": "object" }));
        let response = backend.complete(request).await.unwrap();
        assert_eq!(response.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_server_error_is_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = backend(&server).complete(sample_request()).await.unwrap_err();
        match err {
            WardenError::BackendUnavailable(msg) => assert!(msg.contains("503"), "{msg}"),
            other => panic!("expected BackendUnavailable, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_model_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = backend(&server).complete(sample_request()).await.unwrap_err();
        assert!(matches!(err, WardenError::Model(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_malformed_body_is_model_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = backend(&server).complete(sample_request()).await.unwrap_err();
        assert!(matches!(err, WardenError::Model(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/complete"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "text": "late" }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let mut config = HttpModelConfig::new(server.uri(), "support-model");
        config.timeout = Duration::from_millis(200);
        let backend = HttpModelBackend::new(config).unwrap();

        let err = backend.complete(sample_request()).await.unwrap_err();
        assert!(matches!(err, WardenError::BackendUnavailable(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let backend =
            HttpModelBackend::new(HttpModelConfig::new("http://127.0.0.1:1", "support-model"))
                .unwrap();
        let err = backend.complete(sample_request()).await.unwrap_err();
        assert!(matches!(err, WardenError::BackendUnavailable(_)), "got: {err:?}");
    }
}
