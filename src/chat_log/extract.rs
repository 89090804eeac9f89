//! Text extraction from request and response payloads.

use serde_json::Value;

use crate::api_types::{Message, RequestPayload, ResponsePayload};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptParts {
    /// Non-system messages as `[role]: content` lines.
    pub prompt: String,
    pub system: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseParts {
    pub content: String,
    pub choices: Option<Value>,
    pub finish_reason: String,
}

pub fn prompt_parts(payload: &RequestPayload) -> PromptParts {
    match payload {
        RequestPayload::Chat { messages } => from_messages(messages),
        RequestPayload::Completion { prompt } => PromptParts {
            prompt: prompt.clone(),
            system: String::new(),
            message_count: 1,
        },
        RequestPayload::Claude { system, messages } => {
            let mut parts = from_messages(messages);
            if let Some(system) = system {
                parts.system = system.clone();
            }
            parts
        }
        RequestPayload::Raw(value) => PromptParts {
            prompt: value.to_string(),
            system: String::new(),
            message_count: 1,
        },
    }
}

fn from_messages(messages: &[Message]) -> PromptParts {
    let mut system = String::new();
    let mut lines = Vec::with_capacity(messages.len());

    for message in messages {
        if message.role == "system" {
            system = message.content_text();
        } else {
            lines.push(format!("[{}]: {}", message.role, message.content_text()));
        }
    }

    PromptParts {
        prompt: lines.join("\n"),
        system,
        message_count: messages.len() as i64,
    }
}

pub fn response_parts(payload: &ResponsePayload) -> ResponseParts {
    match payload {
        ResponsePayload::Text {
            content,
            finish_reason,
            choices,
        } => ResponseParts {
            content: content.clone(),
            choices: Some(choices.clone()),
            finish_reason: finish_reason.clone().unwrap_or_default(),
        },
        ResponsePayload::Embedding { vectors } => ResponseParts {
            content: format!("Embedding response with {vectors} vectors"),
            choices: None,
            finish_reason: String::new(),
        },
        ResponsePayload::Raw(value) => ResponseParts {
            content: value.to_string(),
            choices: None,
            finish_reason: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api_types::{ContentPart, MessageContent};

    #[test]
    fn test_chat_prompt_separates_system() {
        let payload = RequestPayload::Chat {
            messages: vec![
                Message::text("system", "Be brief."),
                Message::text("user", "Hi"),
                Message::text("assistant", "Hello!"),
                Message::text("user", "How are you?"),
            ],
        };

        let parts = prompt_parts(&payload);
        assert_eq!(parts.system, "Be brief.");
        assert_eq!(
            parts.prompt,
            "[user]: Hi\n[assistant]: Hello!\n[user]: How are you?"
        );
        assert_eq!(parts.message_count, 4);
    }

    #[test]
    fn test_array_content_joined_with_space() {
        let mut message = Message::text("user", "");
        message.content = Some(MessageContent::Parts(vec![
            ContentPart {
                kind: "text".into(),
                text: Some("look at".into()),
                extra: Default::default(),
            },
            ContentPart {
                kind: "image_url".into(),
                text: None,
                extra: Default::default(),
            },
            ContentPart {
                kind: "text".into(),
                text: Some("this".into()),
                extra: Default::default(),
            },
        ]));

        let parts = prompt_parts(&RequestPayload::Chat {
            messages: vec![message],
        });
        assert_eq!(parts.prompt, "[user]: look at this");
    }

    #[test]
    fn test_completion_prompt() {
        let parts = prompt_parts(&RequestPayload::Completion {
            prompt: "Once upon a time".into(),
        });
        assert_eq!(parts.prompt, "Once upon a time");
        assert_eq!(parts.message_count, 1);
    }

    #[test]
    fn test_claude_top_level_system_wins() {
        let parts = prompt_parts(&RequestPayload::Claude {
            system: Some("You are terse.".into()),
            messages: vec![Message::text("user", "Hi")],
        });
        assert_eq!(parts.system, "You are terse.");
        assert_eq!(parts.prompt, "[user]: Hi");
        assert_eq!(parts.message_count, 1);
    }

    #[test]
    fn test_raw_request_serialized() {
        let parts = prompt_parts(&RequestPayload::Raw(json!({"input": "abc"})));
        assert_eq!(parts.prompt, r#"{"input":"abc"}"#);
    }

    #[test]
    fn test_text_response() {
        let parts = response_parts(&ResponsePayload::Text {
            content: "Hi there".into(),
            finish_reason: Some("stop".into()),
            choices: json!([{"index": 0}]),
        });
        assert_eq!(parts.content, "Hi there");
        assert_eq!(parts.finish_reason, "stop");
        assert!(parts.choices.is_some());
    }

    #[test]
    fn test_embedding_response() {
        let parts = response_parts(&ResponsePayload::Embedding { vectors: 3 });
        assert_eq!(parts.content, "Embedding response with 3 vectors");
    }
}
