use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

/// The canonical inbound request.
///
/// One loose shape covers chat, completion, embedding, moderation, edit and
/// Responses calls. Fields the gateway does not interpret are kept in `extra`
/// and forwarded untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct GeneralRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 256, message = "model is required"))]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,

    /// Completion prompt: a string or an array of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,

    /// Embedding, moderation and Responses input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_options: Option<WebSearchOptions>,

    /// Top-level system prompt (Anthropic-style requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GeneralRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// The output token cap, whichever spelling the client used.
    pub fn max_output(&self) -> Option<u64> {
        self.max_completion_tokens
            .or(self.max_output_tokens)
            .or(self.max_tokens)
    }

    /// `metadata.conversation_id`, if the client supplied one.
    pub fn conversation_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .get("conversation_id")?
            .as_str()
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_context_size: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            name: None,
            extra: Map::new(),
        }
    }

    /// The textual content, with array parts joined by a space.
    pub fn content_text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::joined_text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// One element of array-form message content. Only text is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What kind of call a request is, derived from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    Responses,
    Gemini,
    Unknown,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Self {
        let path = path.trim_end_matches('/');
        match path {
            p if p.ends_with("/chat/completions") => RelayMode::ChatCompletions,
            p if p.ends_with("/completions") => RelayMode::Completions,
            p if p.ends_with("/embeddings") || p.ends_with(":embedContent") => {
                RelayMode::Embeddings
            }
            p if p.ends_with("/moderations") => RelayMode::Moderations,
            p if p.ends_with("/edits") && p.contains("/images/") => RelayMode::ImagesEdits,
            p if p.ends_with("/edits") => RelayMode::Edits,
            p if p.ends_with("/images/generations") => RelayMode::ImagesGenerations,
            p if p.ends_with("/audio/speech") => RelayMode::AudioSpeech,
            p if p.ends_with("/audio/transcriptions") => RelayMode::AudioTranscription,
            p if p.ends_with("/audio/translations") => RelayMode::AudioTranslation,
            p if p.ends_with("/rerank") => RelayMode::Rerank,
            p if p.ends_with("/responses") => RelayMode::Responses,
            p if p.contains(":generateContent") || p.contains(":streamGenerateContent") => {
                RelayMode::Gemini
            }
            _ => RelayMode::Unknown,
        }
    }

    /// The `request_type` recorded on chat log entries.
    pub fn request_type(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat",
            RelayMode::Completions => "completion",
            RelayMode::Embeddings => "embedding",
            RelayMode::Moderations => "moderation",
            RelayMode::Edits => "edit",
            RelayMode::ImagesGenerations => "image_generation",
            RelayMode::ImagesEdits => "image_edit",
            RelayMode::AudioSpeech => "audio_speech",
            RelayMode::AudioTranscription => "audio_transcription",
            RelayMode::AudioTranslation => "audio_translation",
            RelayMode::Rerank => "rerank",
            RelayMode::Responses => "responses",
            RelayMode::Gemini => "gemini",
            RelayMode::Unknown => "unknown",
        }
    }

    /// Upstream path for OpenAI-shaped providers.
    pub fn openai_path(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Moderations => "/v1/moderations",
            RelayMode::Edits => "/v1/edits",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::ImagesEdits => "/v1/images/edits",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::Rerank => "/v1/rerank",
            RelayMode::Responses => "/v1/responses",
            RelayMode::Gemini | RelayMode::Unknown => "/v1/chat/completions",
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_unknown_fields_are_preserved() {
        let req: GeneralRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "tools": [{"type": "web_search_preview"}]
        }))
        .unwrap();

        assert_eq!(req.extra["temperature"], json!(0.2));
        assert_eq!(req.extra["tools"][0]["type"], "web_search_preview");

        let round = serde_json::to_value(&req).unwrap();
        assert_eq!(round["temperature"], json!(0.2));
        assert!(round.get("prompt").is_none());
    }

    #[test]
    fn test_array_content_joined_with_space() {
        let msg: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "Describe"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}},
                {"type": "text", "text": "this image"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.content_text(), "Describe this image");
    }

    #[test]
    fn test_max_output_prefers_newer_spelling() {
        let req = GeneralRequest {
            max_tokens: Some(10),
            max_completion_tokens: Some(20),
            ..Default::default()
        };
        assert_eq!(req.max_output(), Some(20));
    }

    #[test]
    fn test_conversation_id_from_metadata() {
        let req: GeneralRequest = serde_json::from_value(json!({
            "model": "m",
            "metadata": {"conversation_id": "conv-7"}
        }))
        .unwrap();
        assert_eq!(req.conversation_id(), Some("conv-7"));
    }

    #[test]
    fn test_empty_model_fails_validation() {
        assert!(GeneralRequest::default().validate().is_err());
    }

    #[rstest]
    #[case("/v1/chat/completions", RelayMode::ChatCompletions, "chat")]
    #[case("/v1/completions", RelayMode::Completions, "completion")]
    #[case("/v1/embeddings", RelayMode::Embeddings, "embedding")]
    #[case("/v1/moderations", RelayMode::Moderations, "moderation")]
    #[case("/v1/edits", RelayMode::Edits, "edit")]
    #[case("/v1/images/edits", RelayMode::ImagesEdits, "image_edit")]
    #[case("/v1/images/generations", RelayMode::ImagesGenerations, "image_generation")]
    #[case("/v1/audio/transcriptions", RelayMode::AudioTranscription, "audio_transcription")]
    #[case("/v1/rerank", RelayMode::Rerank, "rerank")]
    #[case("/v1/responses", RelayMode::Responses, "responses")]
    #[case("/v1beta/models/gemini-pro:generateContent", RelayMode::Gemini, "gemini")]
    #[case("/v1/unknown", RelayMode::Unknown, "unknown")]
    fn test_relay_mode_from_path(
        #[case] path: &str,
        #[case] mode: RelayMode,
        #[case] request_type: &str,
    ) {
        assert_eq!(RelayMode::from_path(path), mode);
        assert_eq!(mode.request_type(), request_type);
    }
}
