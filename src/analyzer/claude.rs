// Anthropic Messages API. Claude reads PDFs natively, so it prefers the
// document modality: the PDF goes first as a base64 `document` block and the
// instructions follow as text.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use super::{LlmProvider, LlmRequest, Modality};
use crate::error::AnalyzerError;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 8192;

pub struct ClaudeProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn request_body(&self, request: &LlmRequest<'_>) -> Value {
        let content = match request.document {
            Some(pdf) => json!([
                {
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": "application/pdf",
                        "data": base64::engine::general_purpose::STANDARD.encode(pdf)
                    }
                },
                { "type": "text", "text": request.user }
            ]),
            None => json!(request.user),
        };

        json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": request.system,
            "messages": [{ "role": "user", "content": content }]
        })
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    fn primary_modality(&self) -> Modality {
        Modality::Document
    }

    async fn complete(&self, request: &LlmRequest<'_>) -> Result<String, AnalyzerError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() == 429 || body.contains("rate_limit_error") {
            return Err(AnalyzerError::RateLimited(body));
        }
        if !status.is_success() {
            return Err(AnalyzerError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|_| AnalyzerError::Parse {
            preview: body.chars().take(300).collect(),
        })?;
        let text: String = parsed["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            model = %self.model,
            chars = text.len(),
            input_tokens = parsed["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens = parsed["usage"]["output_tokens"].as_u64().unwrap_or(0),
            "Claude response received"
        );

        if text.trim().is_empty() {
            return Err(AnalyzerError::EmptyResponse);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::ServerGuard) -> ClaudeProvider {
        ClaudeProvider::new(
            reqwest::Client::new(),
            format!("{}/v1/messages", server.url()),
            "sk-test",
            "claude-3-5-haiku-20241022",
        )
    }

    #[tokio::test]
    async fn test_document_request_shape_and_text_extraction() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-test")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({
                    "model": "claude-3-5-haiku-20241022",
                    "max_tokens": 8192,
                    "system": "sys"
                })),
                Matcher::Regex(r#""type":"document""#.into()),
                Matcher::Regex(r#""data":"JVBERi0xLjU=""#.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"content":[{"type":"text","text":"{\"ROE\":{\"level\":1}}"}],"usage":{"input_tokens":10,"output_tokens":5}}"#)
            .create_async()
            .await;

        let pdf = b"%PDF-1.5".to_vec();
        let request = LlmRequest { system: "sys", user: "user".into(), document: Some(&pdf) };
        let text = provider(&server).complete(&request).await.unwrap();

        assert_eq!(text, r#"{"ROE":{"level":1}}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_429_is_rate_limited_with_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body(r#"{"type":"error","error":{"type":"rate_limit_error","message":"retry after 12 seconds"}}"#)
            .create_async()
            .await;

        let request = LlmRequest { system: "sys", user: "user".into(), document: None };
        let err = provider(&server).complete(&request).await.unwrap_err();
        match err {
            AnalyzerError::RateLimited(body) => assert!(body.contains("12 seconds")),
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_is_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body(r#"{"type":"error","error":{"type":"authentication_error"}}"#)
            .create_async()
            .await;

        let request = LlmRequest { system: "sys", user: "user".into(), document: None };
        let err = provider(&server).complete(&request).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Api { status: 401, .. }));
    }
}
