use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Apprentice,
    RisingHero,
    Master,
    Unknown,
}

impl Level {
    /// Accepts UI labels with or without their emoji ("🐣 Apprentice", "rising_hero").
    pub fn parse(value: &str) -> Self {
        let normalized: String = value
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();

        match normalized.as_str() {
            "apprentice" => Level::Apprentice,
            "risinghero" | "hero" => Level::RisingHero,
            "master" => Level::Master,
            _ => Level::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Apprentice => "apprentice",
            Level::RisingHero => "rising_hero",
            Level::Master => "master",
            Level::Unknown => "unknown",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Level::Apprentice => "🐣 Apprentice",
            Level::RisingHero => "🦸 Rising Hero",
            Level::Master => "🧠 Master",
            Level::Unknown => "not chosen yet",
        }
    }
}

/// The model's own read on the learner's latest answer. Never independently verified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Judgment {
    Plausible,
    Uncertain,
}

impl Judgment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plausible" | "ok" | "likely_ok" => Some(Judgment::Plausible),
            "check" | "uncertain" | "off" | "review" => Some(Judgment::Uncertain),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One completion as returned by the gateway, before any enforcement.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub text: String,
    /// Present only when the structured judgment channel was used and parsed.
    pub judgment: Option<Judgment>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub grade: String,
    #[serde(default)]
    pub focus: String,
}

impl ChatRequest {
    /// Rejects requests that would waste an upstream call.
    pub fn validate(&self, max_images: usize) -> Result<(), String> {
        if self.message.trim().is_empty() && self.images.is_empty() {
            return Err("Missing 'message' or 'images'".to_string());
        }

        if self.images.len() > max_images {
            return Err(format!(
                "Too many images: {} (limit {max_images})",
                self.images.len()
            ));
        }

        for (index, url) in self.images.iter().enumerate() {
            validate_image_url(url).map_err(|reason| format!("Image {}: {reason}", index + 1))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ChatReply {
    pub fn plain(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResetRequest {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub grade: String,
    #[serde(default)]
    pub focus: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResetResponse {
    pub cleared_messages: u64,
}

pub fn validate_image_url(url: &str) -> Result<(), String> {
    let url = url.trim();
    if url.starts_with("https://") {
        return Ok(());
    }

    let Some(rest) = url.strip_prefix("data:image/") else {
        return Err("expected a data:image/... URL or an https URL".to_string());
    };

    let Some((_, payload)) = rest.split_once(";base64,") else {
        return Err("data URL must be base64 encoded".to_string());
    };

    if payload.is_empty() {
        return Err("data URL has an empty payload".to_string());
    }

    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map(|_| ())
        .map_err(|err| format!("invalid base64 payload: {err}"))
}
