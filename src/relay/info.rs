use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};

use crate::{
    api_types::{GeneralRequest, RelayMode},
    config::ChannelConfig,
};

/// The authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub username: String,
    /// Pricing group.
    pub group: String,
    pub token_id: i64,
    pub token_name: String,
    pub token_unlimited: bool,
    pub admin: bool,
}

/// Transport-level facts about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: String,
    pub client_ip: String,
    pub user_agent: String,
    /// `X-Conversation-ID` header.
    pub conversation_header: Option<String>,
}

/// State of one relay call. Owned by the pipeline for one request and never
/// persisted as-is.
#[derive(Debug)]
pub struct RelayCall {
    pub mode: RelayMode,
    pub caller: Caller,
    pub meta: RequestMeta,
    pub channel: Arc<ChannelConfig>,
    pub request: GeneralRequest,
    /// Model as requested by the client; used for pricing and logs.
    pub origin_model: String,
    /// Model after `model_mapping`; sent upstream and used for token counting.
    pub upstream_model: String,
    pub is_stream: bool,
    /// Prompt tokens counted once before dispatch.
    pub estimated_prompt_tokens: i64,
    pub search_context_size: Option<String>,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

impl RelayCall {
    pub fn elapsed_secs(&self) -> i64 {
        self.started_at.elapsed().as_secs() as i64
    }

    pub fn request_id(&self) -> &str {
        &self.meta.request_id
    }
}
