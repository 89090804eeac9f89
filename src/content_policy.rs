//! Keyword content policy applied to request text before dispatch.
//!
//! ```toml
//! [content_policy]
//! enabled = true
//! words = ["forbidden phrase", "c++"]
//! ```
//!
//! Words are matched as literal, case-insensitive substrings.

use regex::Regex;
use serde_json::Value;

use crate::{api_types::GeneralRequest, config::ContentPolicyConfig};

pub trait ContentPolicy: Send + Sync {
    /// Terms found in `text`, in configuration order, without duplicates.
    fn check(&self, text: &str) -> Vec<String>;
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid content policy word '{word}': {source}")]
pub struct ContentPolicyError {
    word: String,
    #[source]
    source: regex::Error,
}

#[derive(Debug)]
struct CompiledWord {
    regex: Regex,
    word: String,
}

/// Case-insensitive literal keyword matcher.
#[derive(Debug, Default)]
pub struct KeywordPolicy {
    words: Vec<CompiledWord>,
}

impl KeywordPolicy {
    pub fn new<I, S>(words: I) -> Result<Self, ContentPolicyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words = words
            .into_iter()
            .map(Into::into)
            .filter(|w: &String| !w.trim().is_empty())
            .map(|word| {
                Regex::new(&format!("(?i){}", regex::escape(&word)))
                    .map(|regex| CompiledWord {
                        regex,
                        word: word.clone(),
                    })
                    .map_err(|source| ContentPolicyError { word, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { words })
    }

    /// Build from config. A disabled policy matches nothing.
    pub fn from_config(config: &ContentPolicyConfig) -> Result<Self, ContentPolicyError> {
        if !config.enabled {
            return Ok(Self::default());
        }
        Self::new(config.words.iter().cloned())
    }
}

impl ContentPolicy for KeywordPolicy {
    fn check(&self, text: &str) -> Vec<String> {
        let mut hits: Vec<String> = Vec::new();
        for compiled in &self.words {
            if compiled.regex.is_match(text) && !hits.contains(&compiled.word) {
                hits.push(compiled.word.clone());
            }
        }
        hits
    }
}

/// All user-supplied text in a request, newline separated.
pub fn request_text(request: &GeneralRequest) -> String {
    let mut parts = Vec::new();
    if let Some(messages) = &request.messages {
        parts.extend(messages.iter().map(|m| m.content_text()));
    }
    for value in [&request.prompt, &request.input, &request.system]
        .into_iter()
        .flatten()
    {
        collect_strings(value, &mut parts);
    }
    if let Some(instruction) = &request.instruction {
        parts.push(instruction.clone());
    }
    parts.join("\n")
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api_types::Message;

    #[test]
    fn test_case_insensitive_literal_match() {
        let policy = KeywordPolicy::new(["Secret Plan", "c++"]).unwrap();
        assert_eq!(policy.check("the SECRET plan is c++"), vec!["Secret Plan", "c++"]);
        assert!(policy.check("c plus plus").is_empty());
    }

    #[test]
    fn test_repeated_hits_reported_once() {
        let policy = KeywordPolicy::new(["bad"]).unwrap();
        assert_eq!(policy.check("bad bad BAD"), vec!["bad"]);
    }

    #[test]
    fn test_disabled_policy_matches_nothing() {
        let config = ContentPolicyConfig {
            enabled: false,
            words: vec!["bad".into()],
        };
        let policy = KeywordPolicy::from_config(&config).unwrap();
        assert!(policy.check("bad").is_empty());
    }

    #[test]
    fn test_blank_words_ignored() {
        let policy = KeywordPolicy::new(["", "  "]).unwrap();
        assert!(policy.check("anything").is_empty());
    }

    #[test]
    fn test_request_text_covers_all_inputs() {
        let request = GeneralRequest {
            model: "m".into(),
            messages: Some(vec![Message::text("user", "from messages")]),
            input: Some(json!(["from input"])),
            instruction: Some("from instruction".into()),
            ..Default::default()
        };
        let text = request_text(&request);
        assert!(text.contains("from messages"));
        assert!(text.contains("from input"));
        assert!(text.contains("from instruction"));
    }
}
