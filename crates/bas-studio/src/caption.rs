// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Export captions generated by an OpenAI-compatible chat endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Deadline of one caption request.
pub const CAPTION_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You write one-sentence captions for short screen recordings of \
browser automation runs. Answer with the caption only, no quotes, at most 200 characters.";

/// What the captioner knows about an export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptionContext {
    pub export_name: String,
    pub workflow_name: Option<String>,
    /// `step_type` of every frame, in order.
    pub steps: Vec<String>,
    pub urls: Vec<String>,
    pub duration_ms: i64,
}

impl CaptionContext {
    fn prompt(&self) -> String {
        let mut prompt = format!("Recording \"{}\"", self.export_name);
        if let Some(workflow) = &self.workflow_name {
            prompt.push_str(&format!(" of workflow \"{}\"", workflow));
        }
        prompt.push_str(&format!(
            ", {} steps over {:.1} s.",
            self.steps.len(),
            self.duration_ms as f64 / 1000.0
        ));
        if !self.steps.is_empty() {
            prompt.push_str(&format!("\nSteps: {}", self.steps.join(", ")));
        }
        if !self.urls.is_empty() {
            prompt.push_str(&format!("\nPages: {}", self.urls.join(", ")));
        }
        prompt
    }
}

#[async_trait::async_trait]
pub trait CaptionGenerator: Send + Sync {
    async fn generate(&self, context: &CaptionContext) -> Result<String>;
}

/// Client for `POST {base}/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiCaptionGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCaptionGenerator {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CAPTION_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait::async_trait]
impl CaptionGenerator for OpenAiCaptionGenerator {
    async fn generate(&self, context: &CaptionContext) -> Result<String> {
        let prompt = context.prompt();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.4,
            max_tokens: 120,
        };
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::RequestTimeout(format!("caption generation: {}", e))
            } else {
                Error::AiService(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::AiService(format!("status {}: {}", status, text.trim())));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::AiService(format!("invalid response: {}", e)))?;
        let caption = parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .map(|c| c.trim().trim_matches('"').trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::AiService("empty completion".to_string()))?;
        debug!(model = %self.model, chars = caption.len(), "Caption generated");
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> CaptionContext {
        CaptionContext {
            export_name: "Checkout".into(),
            workflow_name: Some("Buy socks".into()),
            steps: vec!["navigate".into(), "click".into()],
            urls: vec!["https://shop.example".into()],
            duration_ms: 2500,
        }
    }

    #[test]
    fn test_prompt_mentions_steps() {
        let prompt = context().prompt();
        assert!(prompt.contains("workflow \"Buy socks\""));
        assert!(prompt.contains("2 steps over 2.5 s"));
        assert!(prompt.contains("Steps: navigate, click"));
    }

    #[tokio::test]
    async fn test_generate_returns_trimmed_caption() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": " \"Buying socks in two clicks\" "}}]
            })))
            .mount(&server)
            .await;

        let generator = OpenAiCaptionGenerator::new(
            format!("{}/v1/", server.uri()),
            Some("sk-test".into()),
            None,
        );
        let caption = generator.generate(&context()).await.unwrap();
        assert_eq!(caption, "Buying socks in two clicks");
    }

    #[tokio::test]
    async fn test_generate_maps_upstream_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let generator = OpenAiCaptionGenerator::new(server.uri(), None, None);
        let err = generator.generate(&context()).await.unwrap_err();
        assert_eq!(err.code(), "AI_SERVICE_ERROR");
        assert!(err.to_string().contains("slow down"));
    }
}
