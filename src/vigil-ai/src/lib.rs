//! vigil-ai - Vision model access for Vigil
//!
//! Talks to an OpenAI-compatible chat completions endpoint: rate-limited,
//! multi-turn requests carrying a JPEG frame, and classification of the
//! reply into a structured safety report or opaque text.

mod client;
mod config;
mod error;
mod history;
mod limiter;
mod prompt;
mod result;

pub use client::AiClient;
pub use config::{AiConfig, SAFETY_SYSTEM_PROMPT};
pub use error::{AiError, Result};
pub use history::{ChatMessage, ContentPart, ConversationHistory, ImageUrl, MessageContent, Role};
pub use limiter::RateLimiter;
pub use prompt::{PromptLibrary, DEFAULT_PROMPT_TEMPLATE, GENERAL_ANALYSIS_PROMPT};
pub use result::{AnalysisResult, ReportedPerson, SafetyReport};
