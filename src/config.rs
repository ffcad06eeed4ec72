use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub structured_judgment: bool,
}

#[derive(Clone, Debug)]
pub struct LimitConfig {
    pub history_turns: usize,
    pub max_images: usize,
    pub max_body_bytes: usize,
    pub generation_concurrency: usize,
    pub memory_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub debug: bool,
    pub models: ModelConfig,
    pub limits: LimitConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").unwrap_or_default().trim().to_string();
        if api_key.is_empty() {
            bail!("OPENAI_API_KEY is missing");
        }

        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());

        Ok(Self {
            bind_addr: env::var("MATHMATE_BIND").unwrap_or_else(|_| format!("0.0.0.0:{port}")),
            data_dir: env::var("MATHMATE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            password: env::var("MATHMATE_PASSWORD")
                .unwrap_or_else(|_| "unlock-mathmate".to_string()),
            debug: flag("DEBUG"),
            models: ModelConfig {
                base_url: env::var("OPENAI_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                api_key,
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                temperature: parsed("MATHMATE_TEMPERATURE", 0.2),
                max_output_tokens: parsed("MATHMATE_MAX_OUTPUT_TOKENS", 400),
                timeout: Duration::from_secs(parsed("MATHMATE_TIMEOUT_SECS", 45)),
                structured_judgment: flag("MATHMATE_STRUCTURED_JUDGMENT"),
            },
            limits: LimitConfig {
                history_turns: parsed("MATHMATE_HISTORY_TURNS", 8),
                max_images: parsed("MATHMATE_MAX_IMAGES", 4),
                max_body_bytes: parsed("MATHMATE_MAX_BODY_BYTES", 16 * 1024 * 1024),
                generation_concurrency: parsed::<usize>("MATHMATE_GENERATION_CONCURRENCY", 4)
                    .max(1),
                memory_capacity: parsed("MATHMATE_MEMORY_CAPACITY", 0),
            },
        })
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("mathmate.sqlite3").display()
        )
    }
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| parse_value(&value))
        .unwrap_or(default)
}

fn parse_value<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn flag(name: &str) -> bool {
    env::var(name).map(|value| is_truthy(&value)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
