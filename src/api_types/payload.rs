use serde_json::Value;

use super::{GeneralRequest, Message, RelayMode};

/// Request shapes the chat log knows how to read, with a raw fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Chat {
        messages: Vec<Message>,
    },
    Completion {
        prompt: String,
    },
    /// Anthropic-style: messages plus a top-level system prompt.
    Claude {
        system: Option<String>,
        messages: Vec<Message>,
    },
    Raw(Value),
}

impl RequestPayload {
    pub fn from_request(mode: RelayMode, request: &GeneralRequest) -> Self {
        match (mode, &request.messages, &request.prompt) {
            (RelayMode::ChatCompletions, Some(messages), _) => match &request.system {
                Some(system) => RequestPayload::Claude {
                    system: system_text(system),
                    messages: messages.clone(),
                },
                None => RequestPayload::Chat {
                    messages: messages.clone(),
                },
            },
            (RelayMode::Completions, _, Some(prompt)) => RequestPayload::Completion {
                prompt: prompt_text(prompt),
            },
            _ => RequestPayload::Raw(serde_json::to_value(request).unwrap_or(Value::Null)),
        }
    }
}

/// Response shapes the chat log knows how to read, with a raw fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Text {
        content: String,
        finish_reason: Option<String>,
        choices: Value,
    },
    Embedding {
        vectors: usize,
    },
    Raw(Value),
}

impl ResponsePayload {
    /// Classify an OpenAI-shaped response body.
    pub fn from_json(body: Value) -> Self {
        if let Some(choices) = body.get("choices").and_then(Value::as_array)
            && let Some(first) = choices.first()
        {
            let content = first
                .pointer("/message/content")
                .or_else(|| first.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let finish_reason = first
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            return ResponsePayload::Text {
                content,
                finish_reason,
                choices: Value::Array(choices.clone()),
            };
        }

        if let Some(data) = body.get("data").and_then(Value::as_array)
            && data.iter().all(|d| d.get("embedding").is_some())
            && !data.is_empty()
        {
            return ResponsePayload::Embedding {
                vectors: data.len(),
            };
        }

        ResponsePayload::Raw(body)
    }
}

fn system_text(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => Some(
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

fn prompt_text(prompt: &Value) -> String {
    match prompt {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
