use std::collections::HashMap;
use std::env;
use std::time::Duration;

use dotenvy::dotenv;

use crate::budget::InputTokenOverride;
use crate::constants::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT_MS};
use crate::models::Model;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CHAT_PROXY_MAX_INPUT_TOKENS must be an integer or a JSON object: {0}")]
    InvalidTokenOverride(String),

    #[error("CHAT_PROXY_MAX_INPUT_TOKENS names an unsupported model: {0}")]
    UnknownOverrideModel(String),

    #[error("CHAT_PROXY_DEFAULT_MODEL is not a supported model: {0}")]
    UnknownDefaultModel(String),
}

/// CORS configuration mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins (for a public deployment)
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// Process configuration, resolved once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cors_mode: CorsMode,
    /// Built-in credential string (one or more keys)
    pub api_keys: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Shared password; `None` disables the check
    pub password: Option<String>,
    pub default_model: Model,
    pub max_input_tokens: InputTokenOverride,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = non_empty("CHAT_PROXY_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = non_empty("CHAT_PROXY_PORT")
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(3000);

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match non_empty("CHAT_PROXY_CORS_ORIGINS").as_deref() {
            Some("*") => CorsMode::AllowAll,
            Some("localhost") | None => CorsMode::LocalhostOnly,
            Some(origins) => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
        };

        let api_keys = lookup("OPENAI_API_KEY").unwrap_or_default();
        let base_url = normalize_base_url(
            non_empty("OPENAI_API_BASE_URL")
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL),
        );
        let timeout = parse_timeout(lookup("CHAT_PROXY_TIMEOUT").as_deref());
        let password = non_empty("CHAT_PROXY_PASSWORD");

        let default_model = match non_empty("CHAT_PROXY_DEFAULT_MODEL") {
            Some(raw) => raw
                .parse::<Model>()
                .map_err(|_| ConfigError::UnknownDefaultModel(raw))?,
            None => Model::Gpt35Turbo,
        };

        let max_input_tokens = match non_empty("CHAT_PROXY_MAX_INPUT_TOKENS") {
            Some(raw) => parse_token_override(&raw)?,
            None => InputTokenOverride::None,
        };

        Ok(Self {
            host,
            port,
            cors_mode,
            api_keys,
            base_url,
            timeout,
            password,
            default_model,
            max_input_tokens,
        })
    }
}

/// Milliseconds; falls back to the default when unset or non-numeric.
pub fn parse_timeout(raw: Option<&str>) -> Duration {
    let ms = raw
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Accepts a bare host (`api.example.com`) or a full URL; strips trailing slashes.
pub fn normalize_base_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

/// Either a single integer for every model or a JSON object keyed by model id.
pub fn parse_token_override(raw: &str) -> Result<InputTokenOverride, ConfigError> {
    let raw = raw.trim();
    if let Ok(limit) = raw.parse::<usize>() {
        return Ok(InputTokenOverride::Global(limit));
    }

    let entries: HashMap<String, usize> = serde_json::from_str(raw)
        .map_err(|e| ConfigError::InvalidTokenOverride(e.to_string()))?;

    let mut map = HashMap::with_capacity(entries.len());
    for (name, limit) in entries {
        let model = name
            .parse::<Model>()
            .map_err(|_| ConfigError::UnknownOverrideModel(name.clone()))?;
        map.insert(model, limit);
    }
    Ok(InputTokenOverride::PerModel(map))
}
