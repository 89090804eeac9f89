use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Built-in tool name for web search calls made through the Responses API.
pub const WEB_SEARCH_PREVIEW: &str = "web_search_preview";
/// Built-in tool name for file search calls made through the Responses API.
pub const FILE_SEARCH: &str = "file_search";

/// Token usage for one call.
///
/// Accepts both the chat completions spelling (`prompt_tokens`) and the
/// Responses API spelling (`input_tokens`). When an upstream sends both, the
/// chat completions field wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireUsage")]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub prompt_tokens_details: PromptTokensDetails,
}

/// Usage as it arrives on the wire, with every spelling optional.
#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<i64>,
    #[serde(default)]
    input_tokens: Option<i64>,
    #[serde(default)]
    completion_tokens: Option<i64>,
    #[serde(default)]
    output_tokens: Option<i64>,
    #[serde(default)]
    total_tokens: Option<i64>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default)]
    input_tokens_details: Option<PromptTokensDetails>,
}

impl From<WireUsage> for Usage {
    fn from(wire: WireUsage) -> Self {
        Self {
            prompt_tokens: wire.prompt_tokens.or(wire.input_tokens).unwrap_or_default(),
            completion_tokens: wire
                .completion_tokens
                .or(wire.output_tokens)
                .unwrap_or_default(),
            total_tokens: wire.total_tokens.unwrap_or_default(),
            prompt_tokens_details: wire
                .prompt_tokens_details
                .or(wire.input_tokens_details)
                .unwrap_or_default(),
        }
    }
}

/// Breakdown of prompt tokens that are priced separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default, deserialize_with = "null_as_default")]
    pub cached_tokens: i64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub image_tokens: i64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub audio_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: PromptTokensDetails::default(),
        }
    }

    /// Usage for a call whose upstream reported nothing: the estimated
    /// prompt and no completion.
    pub fn prompt_only(prompt_tokens: i64) -> Self {
        Self::new(prompt_tokens, 0)
    }

    /// Recompute `total_tokens` from its parts.
    pub fn normalize(&mut self) {
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// Per-call counts of built-in tool invocations, keyed by tool name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolUsage(BTreeMap<String, u32>);

impl ToolUsage {
    pub fn increment(&mut self, tool: &str) {
        *self.0.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, tool: &str) -> u32 {
        self.0.get(tool).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|c| *c == 0)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
