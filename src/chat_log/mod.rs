//! Chat interaction logging.
//!
//! Each settled call becomes one [`ChatLogEntry`]. Entries are deduplicated by
//! (user, normalized prompt hash): the earliest matching entry counts repeats,
//! and a new entry is still appended for every call. Entries sharing a
//! conversation id are marked multi-round once a second call arrives.
//!
//! Logging runs as a background job; failures are logged and never reach the
//! client.

pub mod conversation;
pub mod extract;
pub mod hash;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::{
    api_types::{RelayMode, RequestPayload, ResponsePayload, Usage},
    db::{ChatLogRepo, DbError, DbResult},
    models::{ChatLogEntry, ChatLogFilter, ChatLogPage, ChatLogStats, PageParams},
    observability::metrics,
};

/// Everything the logger needs to know about one finished call.
#[derive(Debug, Clone)]
pub struct ChatInteraction {
    pub user_id: i64,
    pub username: String,
    pub token_id: i64,
    pub token_name: String,
    /// Model as requested by the client.
    pub model_name: String,
    pub channel_id: i64,
    pub channel_name: String,
    pub mode: RelayMode,
    pub request: RequestPayload,
    pub response: ResponsePayload,
    /// `metadata.conversation_id` from the request body.
    pub conversation_id: Option<String>,
    /// `X-Conversation-ID` request header.
    pub conversation_header: Option<String>,
    pub usage: Usage,
    pub quota: i64,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub request_id: String,
    pub user_ip: String,
    pub user_agent: String,
    pub other: Option<Value>,
}

#[derive(Clone)]
pub struct ChatLogger {
    repo: Arc<dyn ChatLogRepo>,
}

impl ChatLogger {
    pub fn new(repo: Arc<dyn ChatLogRepo>) -> Self {
        Self { repo }
    }

    /// Record one call. Returns the id of the new entry.
    #[tracing::instrument(
        skip(self, interaction),
        fields(request_id = %interaction.request_id, user_id = interaction.user_id)
    )]
    pub async fn record(&self, interaction: ChatInteraction) -> DbResult<i64> {
        let prompt = extract::prompt_parts(&interaction.request);
        let response = extract::response_parts(&interaction.response);
        let prompt_hash = hash::prompt_hash(&prompt.prompt);
        let now = Utc::now();
        let conversation_id = conversation::resolve_conversation_id(
            interaction.conversation_id.as_deref(),
            interaction.conversation_header.as_deref(),
            interaction.user_id,
            now,
        );

        let mut duplicate = false;
        match self
            .repo
            .find_by_prompt_hash(interaction.user_id, &prompt_hash)
            .await
        {
            Ok(Some(existing)) => {
                duplicate = true;
                if let Err(e) = self.repo.record_duplicate(existing.id, now).await {
                    tracing::warn!(
                        error = %e,
                        entry_id = existing.id,
                        "Failed to update duplicate count for chat log"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Error checking for existing chat log"),
        }

        let conversation_length = (prompt.prompt.len() + response.content.len()) as i64;
        let entry = ChatLogEntry {
            id: 0,
            user_id: interaction.user_id,
            username: interaction.username,
            token_id: interaction.token_id,
            token_name: interaction.token_name,
            model_name: interaction.model_name,
            channel_id: interaction.channel_id,
            channel_name: interaction.channel_name,
            request_type: interaction.mode.request_type().to_string(),
            prompt_hash,
            prompt_content: prompt.prompt,
            system_prompt: prompt.system,
            response_content: response.content,
            response_choices: response.choices,
            finish_reason: response.finish_reason,
            conversation_id: conversation_id.clone(),
            message_count: prompt.message_count,
            is_multiround: prompt.message_count > 1,
            conversation_length,
            prompt_tokens: interaction.usage.prompt_tokens,
            completion_tokens: interaction.usage.completion_tokens,
            total_tokens: interaction.usage.total_tokens,
            quota: interaction.quota,
            use_time_seconds: interaction.use_time_seconds,
            is_stream: interaction.is_stream,
            duplicate_count: 1,
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            request_id: interaction.request_id,
            user_ip: interaction.user_ip,
            user_agent: interaction.user_agent,
            other: interaction.other,
        };

        let user_id = entry.user_id;
        let id = match self.repo.append(entry).await {
            Ok(id) => id,
            Err(e) => {
                metrics::record_chat_log("failed");
                return Err(e);
            }
        };
        metrics::record_chat_log(if duplicate { "duplicate" } else { "inserted" });

        if let Err(e) = self.refresh_conversation(&conversation_id, user_id).await {
            tracing::warn!(error = %e, %conversation_id, "Failed to update conversation metrics");
        }

        Ok(id)
    }

    /// Recompute multi-round fields for one conversation. Idempotent; returns
    /// the number of entries changed.
    pub async fn refresh_conversation(&self, conversation_id: &str, user_id: i64) -> DbResult<usize> {
        let entries = self
            .repo
            .list_by_conversation(conversation_id, user_id)
            .await?;
        let updates = conversation::conversation_updates(&entries);
        if !updates.is_empty() {
            self.repo.update_conversation_fields(&updates).await?;
        }
        Ok(updates.len())
    }

    pub async fn list_by_user(&self, user_id: i64, page: PageParams) -> DbResult<ChatLogPage> {
        self.repo.list_by_user(user_id, page).await
    }

    pub async fn duplicates(&self, user_id: Option<i64>, limit: i64) -> DbResult<Vec<ChatLogEntry>> {
        self.repo.list_duplicates(user_id, limit).await
    }

    pub async fn longest(&self, user_id: Option<i64>, limit: i64) -> DbResult<Vec<ChatLogEntry>> {
        self.repo.list_longest(user_id, limit).await
    }

    pub async fn list(&self, filter: &ChatLogFilter, page: PageParams) -> DbResult<ChatLogPage> {
        self.repo.list(filter, page).await
    }

    pub async fn stats(&self, filter: &ChatLogFilter) -> DbResult<ChatLogStats> {
        self.repo.stats(filter).await
    }

    pub async fn delete(&self, filter: &ChatLogFilter) -> DbResult<u64> {
        if filter.is_empty() {
            return Err(DbError::Validation(
                "at least one filter condition is required".into(),
            ));
        }
        self.repo.delete(filter).await
    }

    /// Matching entries as JSON Lines, newest first.
    pub async fn export_jsonl(&self, filter: &ChatLogFilter, max_records: i64) -> DbResult<String> {
        let entries = self.repo.export(filter, max_records).await?;
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}
