use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::models::{Judgment, RawCompletion, TokenUsage};

/// The upstream call did not finish within the configured timeout. Safe to retry.
#[derive(Debug)]
pub struct CompletionTimeout {
    pub after: Duration,
}

impl fmt::Display for CompletionTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion timed out after {}s", self.after.as_secs())
    }
}

impl std::error::Error for CompletionTimeout {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn from_db(value: &str) -> Self {
        match value {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn structured_judgment(&self) -> bool {
        self.config.structured_judgment
    }

    /// Sends one chat completion. Expiry of the configured timeout surfaces as
    /// [`CompletionTimeout`] inside the returned error.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<RawCompletion> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.send(messages)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::Error::new(CompletionTimeout { after: timeout })),
        }
    }

    async fn send(&self, messages: &[ChatMessage]) -> Result<RawCompletion> {
        #[derive(Serialize)]
        struct CompletionReq<'a> {
            model: &'a str,
            temperature: f32,
            max_tokens: u32,
            messages: &'a [ChatMessage],
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<ResponseFormat>,
        }

        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }

        #[derive(Deserialize)]
        struct CompletionResp {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: AssistantMessage,
        }

        #[derive(Deserialize)]
        struct AssistantMessage {
            #[serde(default)]
            content: Option<String>,
        }

        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            prompt_tokens: u32,
            #[serde(default)]
            completion_tokens: u32,
        }

        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&CompletionReq {
                model: &self.config.model,
                temperature: self.config.temperature,
                max_tokens: self.config.max_output_tokens,
                messages,
                response_format: self
                    .config
                    .structured_judgment
                    .then_some(ResponseFormat {
                        kind: "json_object",
                    }),
            })
            .send()
            .await
            .context("failed to call chat completions endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "chat completions returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<CompletionResp>()
            .await
            .context("failed to decode chat completions response")?;

        let usage = response
            .usage
            .map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
            .unwrap_or_default();

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        let (text, judgment) = if self.config.structured_judgment {
            parse_structured(&content)
        } else {
            (content, None)
        };

        if text.trim().is_empty() {
            anyhow::bail!("chat completions returned no text");
        }

        Ok(RawCompletion {
            text,
            judgment,
            usage,
        })
    }
}

/// Reads `{"reply", "judgment"}`. Anything else is treated as plain reply text so the
/// in-text tag can still be picked up downstream.
fn parse_structured(content: &str) -> (String, Option<Judgment>) {
    #[derive(Deserialize)]
    struct StructuredReply {
        reply: String,
        #[serde(default)]
        judgment: Option<String>,
    }

    match serde_json::from_str::<StructuredReply>(content.trim()) {
        Ok(parsed) => (
            parsed.reply,
            parsed.judgment.as_deref().and_then(Judgment::parse),
        ),
        Err(err) => {
            tracing::warn!("structured reply did not parse, using raw text: {err}");
            (content.to_string(), None)
        }
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json
            .get("error")
            .and_then(|v| v.get("message").or(Some(v)))
            .and_then(|v| v.as_str())
        {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
