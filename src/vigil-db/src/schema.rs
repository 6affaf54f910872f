//! Database schema types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Template name assigned to streams that never chose one
pub const DEFAULT_TEMPLATE_NAME: &str = "DEFAULT_PROMPT_TEMPLATE";

/// Person features older than this are evicted on read
pub const PERSON_RETENTION_SECS: i64 = 2 * 60 * 60;

/// Configured video stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: i64,
    pub url: String,
    pub added_time: DateTime<Utc>,
    pub prompt_template: String,
}

/// Analysis result to persist
#[derive(Debug, Clone)]
pub struct NewAnalysisResult {
    pub stream_id: i64,
    pub timestamp: DateTime<Utc>,
    pub result: serde_json::Value,
}

/// Persisted analysis result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub stream_id: i64,
    pub timestamp: DateTime<Utc>,
    pub result: serde_json::Value,
}

/// Re-identification record for one tracked person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonFeatures {
    pub id: String,
    pub features: serde_json::Value,
    pub position: Option<String>,
    pub action: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
