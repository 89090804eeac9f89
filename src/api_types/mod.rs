//! Wire types shared by the relay, the adaptors and the chat log.

pub mod payload;
pub mod request;
pub mod usage;

pub use payload::{RequestPayload, ResponsePayload};
pub use request::{
    ContentPart, GeneralRequest, Message, MessageContent, RelayMode, WebSearchOptions,
};
pub use usage::{FILE_SEARCH, PromptTokensDetails, ToolUsage, Usage, WEB_SEARCH_PREVIEW};
