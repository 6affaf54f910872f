//! Error types for the AI client

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the vision endpoint
#[derive(Error, Debug)]
pub enum AiError {
    /// Network or transport failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response
    #[error("ai service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// 429 response; the client already waited `retry_after`
    #[error("rate limited, retried after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Response did not carry `choices[0].message.content`
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AiError>;
