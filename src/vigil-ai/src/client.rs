//! Conversational client for an OpenAI-compatible chat completions endpoint

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AiConfig;
use crate::error::{AiError, Result};
use crate::history::{ChatMessage, ConversationHistory};
use crate::limiter::RateLimiter;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    request_id: &'a str,
    user_id: &'a str,
}

/// One conversation with the vision model.
///
/// Holds its own history, rate limiter and client identity; callers that
/// need independent conversations create independent clients.
pub struct AiClient {
    config: AiConfig,
    http: reqwest::Client,
    limiter: RateLimiter,
    history: Mutex<ConversationHistory>,
    user_id: String,
}

impl AiClient {
    pub fn new(config: AiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            limiter: RateLimiter::new(config.min_request_interval),
            history: Mutex::new(ConversationHistory::new(config.history_limit)),
            user_id: Uuid::new_v4().to_string(),
            http,
            config,
        })
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn history(&self) -> MutexGuard<'_, ConversationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn history_len(&self) -> usize {
        self.history().len()
    }

    /// Forget the conversation; requests already in flight are unaffected
    pub fn clear_history(&self) {
        self.history().clear();
        info!("conversation history cleared for client {}", self.user_id);
    }

    /// Send one user turn and return the assistant's reply.
    ///
    /// Waits for the rate limiter first. A 429 response is answered by
    /// sleeping for the server's Retry-After hint before returning
    /// `AiError::RateLimited`; the caller decides whether to try again.
    /// Only successful exchanges are added to the history.
    pub async fn send_request(&self, prompt: &str, image_base64: Option<&str>) -> Result<String> {
        self.limiter.acquire().await;

        let messages = {
            let history = self.history();
            let mut messages = Vec::with_capacity(history.len() + 2);
            messages.push(ChatMessage::system(&self.config.system_prompt));
            messages.extend(history.iter().cloned());
            messages.push(ChatMessage::user(prompt, image_base64));
            messages
        };

        let request_id = Uuid::new_v4().to_string();
        let body = ChatRequest {
            model: &self.config.model,
            messages: &messages,
            request_id: &request_id,
            user_id: &self.user_id,
        };

        let url = self.config.completions_url();
        debug!(
            "sending request {} to {} ({} messages, image: {})",
            request_id,
            url,
            messages.len(),
            messages.last().map_or(false, ChatMessage::has_image)
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("error sending request to ai service: {}", e);
                AiError::from(e)
            })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_hint(
                response.headers(),
                self.config.default_retry_after,
                self.config.max_retry_after,
            );
            let text = response.text().await.unwrap_or_default();
            warn!(
                "rate limit exceeded, retrying after {}s: {}",
                retry_after.as_secs_f64(),
                text.trim()
            );
            tokio::time::sleep(retry_after).await;
            return Err(AiError::RateLimited { retry_after });
        }

        let text = response.text().await?;

        if !status.is_success() {
            error!("ai service returned {}: {}", status, text.trim());
            return Err(AiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let payload: Value = serde_json::from_str(&text)?;
        let reply = extract_content(&payload)?;

        {
            let mut history = self.history();
            history.push(ChatMessage::user(prompt, None));
            history.push(ChatMessage::assistant(reply.clone()));
            if history.len() == history.limit() {
                debug!("history for client {} is full ({} messages)", self.user_id, history.limit());
            }
        }

        Ok(reply)
    }
}

/// Retry-After in seconds, bounded by `max`
fn retry_after_hint(headers: &HeaderMap, default: Duration, max: Duration) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
        .min(max)
}

fn extract_content(payload: &Value) -> Result<String> {
    let content = payload
        .pointer("/choices/0/message/content")
        .ok_or_else(|| AiError::MalformedResponse("missing choices[0].message.content".to_string()))?;

    match content {
        Value::String(text) => Ok(text.clone()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                Err(AiError::MalformedResponse("content has no text parts".to_string()))
            } else {
                Ok(text.concat())
            }
        }
        other => Err(AiError::MalformedResponse(format!("unexpected content: {}", other))),
    }
}
