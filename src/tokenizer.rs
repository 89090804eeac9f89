//! Prompt and completion token counting.
//!
//! Counts are estimates used for pre-authorization and as a fallback when an
//! upstream never reports completion usage. Authoritative usage always comes
//! from the upstream when it is available.

use std::sync::Arc;

use serde_json::Value;

use crate::api_types::{GeneralRequest, RelayMode};

/// Overhead tokens per chat message, and for priming the reply.
const TOKENS_PER_MESSAGE: i64 = 3;
const TOKENS_PER_NAME: i64 = 1;
const REPLY_PRIMING_TOKENS: i64 = 3;

pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> u32;
}

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer encoding: {0}")]
    Load(String),
}

/// Roughly four characters per token. Used when the `tokenizer` feature is
/// disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count_text(&self, text: &str, _model: &str) -> u32 {
        let chars = text.chars().count();
        chars.div_ceil(4).min(u32::MAX as usize) as u32
    }
}

#[cfg(feature = "tokenizer")]
pub use tiktoken_counter::TiktokenCounter;

#[cfg(feature = "tokenizer")]
mod tiktoken_counter {
    use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

    use super::{TokenCounter, TokenizerError};

    /// BPE counting with `o200k_base` for gpt-4o and o-series models and
    /// `cl100k_base` for everything else.
    pub struct TiktokenCounter {
        o200k: CoreBPE,
        cl100k: CoreBPE,
    }

    impl TiktokenCounter {
        pub fn new() -> Result<Self, TokenizerError> {
            Ok(Self {
                o200k: o200k_base().map_err(|e| TokenizerError::Load(e.to_string()))?,
                cl100k: cl100k_base().map_err(|e| TokenizerError::Load(e.to_string()))?,
            })
        }

        fn encoding_for(&self, model: &str) -> &CoreBPE {
            let model = model.to_ascii_lowercase();
            let o_series = model.starts_with('o')
                && model.chars().nth(1).is_some_and(|c| c.is_ascii_digit());
            if model.starts_with("gpt-4o")
                || model.starts_with("gpt-4.1")
                || model.starts_with("gpt-5")
                || model.starts_with("chatgpt-4o")
                || o_series
            {
                &self.o200k
            } else {
                &self.cl100k
            }
        }
    }

    impl TokenCounter for TiktokenCounter {
        fn count_text(&self, text: &str, model: &str) -> u32 {
            if text.is_empty() {
                return 0;
            }
            let count = self.encoding_for(model).encode_with_special_tokens(text).len();
            count.min(u32::MAX as usize) as u32
        }
    }
}

/// The best counter compiled in. Falls back to the heuristic if the BPE
/// tables fail to load.
pub fn default_counter() -> Arc<dyn TokenCounter> {
    #[cfg(feature = "tokenizer")]
    {
        match TiktokenCounter::new() {
            Ok(counter) => return Arc::new(counter),
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to heuristic token counting");
            }
        }
    }
    Arc::new(HeuristicCounter)
}

/// Estimated prompt tokens for a request.
pub fn count_request_tokens(
    counter: &dyn TokenCounter,
    mode: RelayMode,
    request: &GeneralRequest,
    model: &str,
) -> i64 {
    let count = |text: &str| i64::from(counter.count_text(text, model));

    match mode {
        RelayMode::ChatCompletions => {
            let Some(messages) = &request.messages else {
                return 0;
            };
            let mut total = REPLY_PRIMING_TOKENS;
            for message in messages {
                total += TOKENS_PER_MESSAGE;
                total += count(&message.role);
                total += count(&message.content_text());
                if let Some(name) = &message.name {
                    total += TOKENS_PER_NAME + count(name);
                }
            }
            if let Some(system) = request.system.as_ref() {
                total += count(&value_text(system));
            }
            total
        }
        RelayMode::Completions => request
            .prompt
            .as_ref()
            .map(|p| count(&value_text(p)))
            .unwrap_or(0),
        RelayMode::Edits => {
            let instruction = request.instruction.as_deref().map(count).unwrap_or(0);
            let input = request.input.as_ref().map(|i| count(&value_text(i))).unwrap_or(0);
            instruction + input
        }
        RelayMode::Embeddings | RelayMode::Moderations | RelayMode::Responses => request
            .input
            .as_ref()
            .map(|i| count(&value_text(i)))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Flatten a string, an array of strings, or arbitrary JSON into text.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api_types::Message;

    #[test]
    fn test_heuristic_counts_chars() {
        let counter = HeuristicCounter;
        assert_eq!(counter.count_text("", "m"), 0);
        assert_eq!(counter.count_text("abcd", "m"), 1);
        assert_eq!(counter.count_text("abcde", "m"), 2);
    }

    #[test]
    fn test_chat_overhead() {
        let request = GeneralRequest {
            model: "m".into(),
            messages: Some(vec![Message::text("user", "abcd")]),
            ..Default::default()
        };
        // priming 3 + message 3 + role "user" 1 + content 1
        assert_eq!(
            count_request_tokens(&HeuristicCounter, RelayMode::ChatCompletions, &request, "m"),
            8
        );
    }

    #[test]
    fn test_embedding_input_array() {
        let request = GeneralRequest {
            model: "m".into(),
            input: Some(json!(["abcd", "abcd"])),
            ..Default::default()
        };
        // "abcd\nabcd" is 9 chars
        assert_eq!(
            count_request_tokens(&HeuristicCounter, RelayMode::Embeddings, &request, "m"),
            3
        );
    }

    #[test]
    fn test_unsupported_mode_counts_zero() {
        let request = GeneralRequest {
            model: "m".into(),
            input: Some(json!("abcd")),
            ..Default::default()
        };
        assert_eq!(
            count_request_tokens(&HeuristicCounter, RelayMode::AudioSpeech, &request, "m"),
            0
        );
    }

    #[cfg(feature = "tokenizer")]
    #[test]
    fn test_tiktoken_counts() {
        let counter = TiktokenCounter::new().unwrap();
        assert_eq!(counter.count_text("", "gpt-4o"), 0);
        assert!(counter.count_text("hello world", "gpt-4o") >= 2);
        assert!(counter.count_text("hello world", "gpt-3.5-turbo") >= 2);
    }
}
