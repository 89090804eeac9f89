use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::error::DbResult,
    models::{
        ChatLogEntry, ChatLogFilter, ChatLogPage, ChatLogStats, ConversationUpdate, PageParams,
    },
};

#[async_trait]
pub trait ChatLogRepo: Send + Sync {
    /// Insert a new entry and return its id. The `id` field of `entry` is ignored.
    async fn append(&self, entry: ChatLogEntry) -> DbResult<i64>;

    /// Earliest entry for this user with the same prompt hash.
    async fn find_by_prompt_hash(
        &self,
        user_id: i64,
        prompt_hash: &str,
    ) -> DbResult<Option<ChatLogEntry>>;

    /// Increment `duplicate_count` and refresh `last_seen_at`.
    async fn record_duplicate(&self, id: i64, seen_at: DateTime<Utc>) -> DbResult<()>;

    /// All entries of a conversation for one user, oldest first.
    async fn list_by_conversation(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> DbResult<Vec<ChatLogEntry>>;

    async fn update_conversation_fields(&self, updates: &[ConversationUpdate]) -> DbResult<()>;

    /// A user's own entries, newest first.
    async fn list_by_user(&self, user_id: i64, page: PageParams) -> DbResult<ChatLogPage>;

    /// Entries seen more than once, most repeated first.
    async fn list_duplicates(&self, user_id: Option<i64>, limit: i64)
    -> DbResult<Vec<ChatLogEntry>>;

    /// Multi-round entries with the longest conversations first.
    async fn list_longest(&self, user_id: Option<i64>, limit: i64) -> DbResult<Vec<ChatLogEntry>>;

    async fn list(&self, filter: &ChatLogFilter, page: PageParams) -> DbResult<ChatLogPage>;

    async fn stats(&self, filter: &ChatLogFilter) -> DbResult<ChatLogStats>;

    /// Delete matching entries. An empty filter is rejected.
    async fn delete(&self, filter: &ChatLogFilter) -> DbResult<u64>;

    /// Matching entries, newest first, capped at `max_records`.
    async fn export(&self, filter: &ChatLogFilter, max_records: i64)
    -> DbResult<Vec<ChatLogEntry>>;
}
