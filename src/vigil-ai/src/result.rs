//! Parsing of model replies into safety reports

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

/// Keys that mark a reply as a safety report
const REPORT_KEYS: &[&str] = &["violation_detected", "description", "people", "vehicles"];

/// A person as described by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedPerson {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub features: Value,
    #[serde(default, deserialize_with = "lenient_string")]
    pub position: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
}

/// Structured reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub violation_detected: bool,
    #[serde(default, deserialize_with = "lenient_text")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_people")]
    pub people: Vec<ReportedPerson>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub vehicles: Vec<Value>,
    /// Any other keys the model returned
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reply classified once at parse time
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisResult {
    Structured(SafetyReport),
    /// Free text or JSON of an unexpected shape
    Opaque(String),
}

impl AnalysisResult {
    /// Classify a raw reply. Markdown code fences around JSON are ignored.
    pub fn parse(raw: &str) -> Self {
        let body = strip_code_fence(raw);

        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => return AnalysisResult::Opaque(raw.to_string()),
        };

        let is_report = value
            .as_object()
            .map_or(false, |obj| REPORT_KEYS.iter().any(|k| obj.contains_key(*k)));
        if !is_report {
            return AnalysisResult::Opaque(raw.to_string());
        }

        match serde_json::from_value::<SafetyReport>(value) {
            Ok(report) => AnalysisResult::Structured(report),
            Err(_) => AnalysisResult::Opaque(raw.to_string()),
        }
    }

    /// Persistable form; opaque replies become `{"raw_text": ...}`
    pub fn to_json(&self) -> Value {
        match self {
            AnalysisResult::Structured(report) => {
                let mut obj = report.extra.clone();
                obj.insert("violation_detected".into(), json!(report.violation_detected));
                obj.insert("description".into(), json!(report.description));
                obj.insert("people".into(), json!(report.people));
                obj.insert("vehicles".into(), json!(report.vehicles));
                Value::Object(obj)
            }
            AnalysisResult::Opaque(text) => json!({ "raw_text": text }),
        }
    }

    pub fn people(&self) -> &[ReportedPerson] {
        match self {
            AnalysisResult::Structured(report) => &report.people,
            AnalysisResult::Opaque(_) => &[],
        }
    }

    /// Description of a detected violation, if any
    pub fn violation(&self) -> Option<&str> {
        match self {
            AnalysisResult::Structured(r) if r.violation_detected => Some(&r.description),
            _ => None,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, AnalysisResult::Structured(_))
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    lenient_string(d).map(Option::unwrap_or_default)
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        _ => false,
    })
}

fn lenient_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Value>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items,
        _ => Vec::new(),
    })
}

/// Keeps the people entries that are objects, drops the rest
fn lenient_people<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<ReportedPerson>, D::Error> {
    Ok(lenient_list(d)?
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}
