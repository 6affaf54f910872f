//! Client configuration

use std::time::Duration;

/// Instruction sent as the first message of every request
pub const SAFETY_SYSTEM_PROMPT: &str = "You are a professional construction site safety analysis assistant. \
You analyse images from site cameras and give concrete safety advice.";

#[derive(Debug, Clone, PartialEq)]
pub struct AiConfig {
    pub model: String,
    pub api_key: String,
    /// Base url; `/chat/completions` is appended
    pub api_base: String,
    /// Minimum spacing between two requests from one client
    pub min_request_interval: Duration,
    pub request_timeout: Duration,
    /// Messages kept in the rolling conversation
    pub history_limit: usize,
    /// Wait used when a 429 carries no usable Retry-After
    pub default_retry_after: Duration,
    /// Upper bound on any Retry-After wait
    pub max_retry_after: Duration,
    pub system_prompt: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            min_request_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            history_limit: 10,
            default_retry_after: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(300),
            system_prompt: SAFETY_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl AiConfig {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            api_base: api_base.into(),
            ..Self::default()
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}
