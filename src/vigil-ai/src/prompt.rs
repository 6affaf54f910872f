//! Named prompt templates

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Template used when nothing else resolves
pub const GENERAL_ANALYSIS_PROMPT: &str = "GENERAL_ANALYSIS_PROMPT";

/// Template assigned to newly added streams
pub const DEFAULT_PROMPT_TEMPLATE: &str = "DEFAULT_PROMPT_TEMPLATE";

const GENERAL_ANALYSIS_TEXT: &str =
    "Analyse this image and describe the main objects, the scene and the activities you see.";

const DEFAULT_TEMPLATE_TEXT: &str = r#"Inspect this construction site image for safety violations such as missing hard hats, missing high-visibility vests, unsafe work at height, or people inside vehicle operating areas.
Reply with JSON only, in this shape:
{"violation_detected": true|false, "description": "...", "people": [{"id": "...", "features": {...}, "position": "...", "action": "..."}], "vehicles": [...]}
Reuse the id of a previously identified person when the same person appears again."#;

const REID_CONTEXT_HEADER: &str =
    "Previously identified people (consider them when assigning ids in this analysis):";

/// Mapping of template name to template text
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: BTreeMap<String, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        let mut templates = BTreeMap::new();
        templates.insert(GENERAL_ANALYSIS_PROMPT.to_string(), GENERAL_ANALYSIS_TEXT.to_string());
        templates.insert(DEFAULT_PROMPT_TEMPLATE.to_string(), DEFAULT_TEMPLATE_TEXT.to_string());
        Self { templates }
    }
}

impl PromptLibrary {
    /// Built-in templates overridden or extended by `custom`
    pub fn new(custom: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut library = Self::default();
        library.templates.extend(custom);
        library
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(name.into(), template.into());
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Template text for `name`, falling back to `fallback` and then the general prompt
    pub fn resolve(&self, name: &str, fallback: &str) -> &str {
        if let Some(template) = self.get(name) {
            return template;
        }
        warn!("unknown prompt template '{}', using '{}'", name, fallback);
        self.get(fallback)
            .or_else(|| self.get(GENERAL_ANALYSIS_PROMPT))
            .unwrap_or(GENERAL_ANALYSIS_TEXT)
    }

    /// Resolve a template and append the re-identification context as JSON
    pub fn compose<T: Serialize>(&self, name: &str, fallback: &str, reid: &[T]) -> String {
        let mut prompt = self.resolve(name, fallback).to_string();
        if reid.is_empty() {
            return prompt;
        }

        match serde_json::to_string(reid) {
            Ok(context) => {
                prompt.push_str("\n\n");
                prompt.push_str(REID_CONTEXT_HEADER);
                prompt.push('\n');
                prompt.push_str(&context);
            }
            Err(e) => warn!("failed to serialize reid context: {}", e),
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_custom_templates_override_builtins() {
        let library = PromptLibrary::new([
            ("HARDHAT".to_string(), "count hard hats".to_string()),
            (GENERAL_ANALYSIS_PROMPT.to_string(), "describe".to_string()),
        ]);

        assert_eq!(library.get("HARDHAT"), Some("count hard hats"));
        assert_eq!(library.get(GENERAL_ANALYSIS_PROMPT), Some("describe"));
        assert!(library.get(DEFAULT_PROMPT_TEMPLATE).is_some());
        assert_eq!(library.names().count(), 3);
    }

    #[test]
    fn test_resolve_falls_back() {
        let library = PromptLibrary::default();
        assert_eq!(
            library.resolve("MISSING", GENERAL_ANALYSIS_PROMPT),
            GENERAL_ANALYSIS_TEXT
        );
        assert_eq!(library.resolve("MISSING", "ALSO_MISSING"), GENERAL_ANALYSIS_TEXT);
        assert_eq!(
            library.resolve(DEFAULT_PROMPT_TEMPLATE, GENERAL_ANALYSIS_PROMPT),
            DEFAULT_TEMPLATE_TEXT
        );
    }

    #[test]
    fn test_compose_appends_reid_context() {
        let library = PromptLibrary::new([("T".to_string(), "look".to_string())]);

        assert_eq!(library.compose::<serde_json::Value>("T", "T", &[]), "look");

        let prompt = library.compose("T", "T", &[json!({"id": "p1", "position": "gate"})]);
        assert!(prompt.starts_with("look\n\n"));
        assert!(prompt.ends_with(r#"[{"id":"p1","position":"gate"}]"#));
    }
}
