use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use council_types::{CouncilError, Result};

use crate::{ChatRequest, ChatResponse, LlmClient};

// ---------------------------------------------------------------------------
// OpenAiClient
// ---------------------------------------------------------------------------

/// Client for any OpenAI-compatible `/v1/chat/completions` endpoint.
#[derive(Debug)]
pub struct OpenAiClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    /// Reads `OPENAI_API_KEY`, plus the optional `OPENAI_BASE_URL` and `COUNCIL_MODEL`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| CouncilError::AuthError {
            provider: "openai".into(),
        })?;
        let mut client = Self::new(key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            client = client.with_base_url(url);
        }
        if let Ok(model) = std::env::var("COUNCIL_MODEL") {
            client = client.with_model(model);
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.default_model = model;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn build_request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                let mut m = json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                });
                if let Some(name) = &msg.name {
                    m["name"] = json!(sanitize_name(name));
                }
                m
            })
            .collect();

        let model = request
            .config
            .model
            .as_deref()
            .unwrap_or(&self.default_model);

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.config.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn parse_response(&self, body: serde_json::Value) -> Result<ChatResponse> {
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CouncilError::ProviderError {
                provider: "openai".into(),
                status: 200,
                message: "response has no choices[0].message.content".into(),
                retryable: false,
            })?
            .to_string();
        let model = body["model"].as_str().unwrap_or("").to_string();
        Ok(ChatResponse { content, model })
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_request_body(request);

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| CouncilError::ProviderError {
                provider: "openai".into(),
                status: 0,
                message: e.to_string(),
                retryable: true,
            })?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(|e| CouncilError::ProviderError {
            provider: "openai".into(),
            status: 0,
            message: e.to_string(),
            retryable: true,
        })?;

        if !status.is_success() {
            return Err(map_error(status, &response_body));
        }

        let json: serde_json::Value =
            serde_json::from_str(&response_body).map_err(|e| CouncilError::ProviderError {
                provider: "openai".into(),
                status: status.as_u16(),
                message: format!("Failed to parse response JSON: {e}"),
                retryable: false,
            })?;

        self.parse_response(json)
    }
}

/// The API only accepts `[A-Za-z0-9_-]` in message names.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> CouncilError {
    let status_u16 = status.as_u16();
    match status_u16 {
        401 | 403 => CouncilError::AuthError {
            provider: "openai".into(),
        },
        429 | 500 | 502 | 503 | 504 => CouncilError::ProviderError {
            provider: "openai".into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => CouncilError::ProviderError {
            provider: "openai".into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// LlmClient implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        tracing::debug!(
            model = request.config.model.as_deref().unwrap_or(&self.default_model),
            messages = request.messages.len(),
            "LLM request"
        );
        match request.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), self.send(request))
                .await
                .map_err(|_| CouncilError::RequestTimeout {
                    provider: "openai".into(),
                    timeout_ms: ms,
                })?,
            None => self.send(request).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, ModelConfig};

    fn client() -> OpenAiClient {
        OpenAiClient::new("sk-test".into())
    }

    #[test]
    fn build_body_uses_default_model_and_roles() {
        let req = ChatRequest::new(vec![
            Message::system("You are helpful."),
            Message::user("Hello").with_name("Sir Ada"),
        ]);
        let body = client().build_request_body(&req);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["messages"][1]["name"], "Sir_Ada");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn build_body_applies_model_config() {
        let req = ChatRequest::new(vec![Message::user("x")]).with_config(ModelConfig {
            model: Some("custom".into()),
            temperature: Some(0.2),
            max_tokens: Some(64),
        });
        let body = client().build_request_body(&req);
        assert_eq!(body["model"], "custom");
        assert_eq!(body["max_tokens"], 64);
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn parse_response_reads_first_choice() {
        let body = json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
        });
        let resp = client().parse_response(body).unwrap();
        assert_eq!(resp.content, "Hi there");
        assert_eq!(resp.model, "gpt-4o-mini");
    }

    #[test]
    fn parse_response_without_choices_is_error() {
        let err = client().parse_response(json!({"choices": []})).unwrap_err();
        assert!(matches!(err, CouncilError::ProviderError { retryable: false, .. }));
    }

    #[test]
    fn error_mapping_401_auth() {
        let err = map_error(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "invalid api key"}}"#,
        );
        assert!(matches!(err, CouncilError::AuthError { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_mapping_429_and_500_retryable() {
        for status in [reqwest::StatusCode::TOO_MANY_REQUESTS, reqwest::StatusCode::INTERNAL_SERVER_ERROR] {
            match map_error(status, r#"{"error": {"message": "busy"}}"#) {
                CouncilError::ProviderError { retryable, message, .. } => {
                    assert!(retryable);
                    assert_eq!(message, "busy");
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn error_mapping_400_not_retryable_raw_body() {
        match map_error(reqwest::StatusCode::BAD_REQUEST, "plain text") {
            CouncilError::ProviderError { retryable, message, status, .. } => {
                assert!(!retryable);
                assert_eq!(status, 400);
                assert_eq!(message, "plain text");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let c = client().with_base_url("http://localhost:8080/".into());
        assert_eq!(c.base_url, "http://localhost:8080");
    }
}
