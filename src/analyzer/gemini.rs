// Gemini generateContent. Text-first: the system and user prompts are folded
// into one user turn, and the PDF (when sent) rides along as inline data.
// JSON output is requested through responseMimeType.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use super::{LlmProvider, LlmRequest, Modality};
use crate::error::AnalyzerError;

pub struct GeminiProvider {
    client: reqwest::Client,
    /// Base models URL; `/{model}:generateContent` is appended.
    api_url: String,
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.api_url.trim_end_matches('/'), self.model)
    }

    fn request_body(&self, request: &LlmRequest<'_>) -> Value {
        let mut parts = vec![json!({ "text": format!("{}\n\n---\n\n{}", request.system, request.user) })];
        if let Some(pdf) = request.document {
            parts.push(json!({
                "inline_data": {
                    "mime_type": "application/pdf",
                    "data": base64::engine::general_purpose::STANDARD.encode(pdf)
                }
            }));
        }

        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": 0.1,
                "topP": 0.95,
                "topK": 40,
                "maxOutputTokens": 8192,
                "responseMimeType": "application/json"
            }
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn primary_modality(&self) -> Modality {
        Modality::Text
    }

    async fn complete(&self, request: &LlmRequest<'_>) -> Result<String, AnalyzerError> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() == 429 || body.contains("RESOURCE_EXHAUSTED") {
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
        let text: String = parsed["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default();

        debug!(
            model = %self.model,
            chars = text.len(),
            finish_reason = parsed["candidates"][0]["finishReason"].as_str().unwrap_or(""),
            "Gemini response received"
        );

        if text.trim().is_empty() {
            return Err(AnalyzerError::EmptyResponse);
        }
        Ok(text)
    }
}
