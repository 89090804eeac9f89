use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// Maximum page size for user-facing list queries.
pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Maximum number of records in one export.
pub const MAX_EXPORT_RECORDS: i64 = 100_000;
pub const DEFAULT_EXPORT_RECORDS: i64 = 10_000;
/// Number of rows in each "top" list of the stats report.
pub const STATS_TOP_N: i64 = 10;

/// One recorded relay call.
///
/// `duplicate_count` starts at 1 and is bumped on the *earliest* entry for the
/// same (user, prompt hash) each time the prompt is seen again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub token_id: i64,
    pub token_name: String,
    pub model_name: String,
    pub channel_id: i64,
    pub channel_name: String,
    pub request_type: String,

    pub prompt_hash: String,
    pub prompt_content: String,
    pub system_prompt: String,
    pub response_content: String,
    pub response_choices: Option<Value>,
    pub finish_reason: String,

    pub conversation_id: String,
    pub message_count: i64,
    pub is_multiround: bool,
    /// Characters of prompt plus response; for multi-round conversations the
    /// longest entry carries the conversation maximum.
    pub conversation_length: i64,

    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub quota: i64,
    pub use_time_seconds: i64,
    pub is_stream: bool,

    pub duplicate_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    pub request_id: String,
    pub user_ip: String,
    pub user_agent: String,
    pub other: Option<Value>,
}

/// Conversation-level fields recomputed after each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub id: i64,
    pub is_multiround: bool,
    pub conversation_length: i64,
}

/// Admin filter. Every set field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatLogFilter {
    pub user_id: Option<i64>,
    /// Substring match.
    pub model_name: Option<String>,
    pub request_type: Option<String>,
    pub conversation_id: Option<String>,
    pub min_duplicate_count: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ChatLogFilter {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.model_name.as_deref().is_none_or(str::is_empty)
            && self.request_type.as_deref().is_none_or(str::is_empty)
            && self.conversation_id.as_deref().is_none_or(str::is_empty)
            && self.min_duplicate_count.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
    }

    pub fn matches(&self, entry: &ChatLogEntry) -> bool {
        self.user_id.is_none_or(|id| entry.user_id == id)
            && self
                .model_name
                .as_deref()
                .is_none_or(|m| entry.model_name.contains(m))
            && self
                .request_type
                .as_deref()
                .is_none_or(|t| t.is_empty() || entry.request_type == t)
            && self
                .conversation_id
                .as_deref()
                .is_none_or(|c| c.is_empty() || entry.conversation_id == c)
            && self
                .min_duplicate_count
                .is_none_or(|min| entry.duplicate_count >= min)
            && self.start_time.is_none_or(|t| entry.created_at >= t)
            && self.end_time.is_none_or(|t| entry.created_at <= t)
    }
}

/// Page request for user-facing lists.
#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct PageParams {
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: i64,

    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 100))]
    pub page_size: i64,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl PageParams {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit()
    }

    pub fn limit(&self) -> i64 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatLogPage {
    pub items: Vec<ChatLogEntry>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserCount {
    pub user_id: i64,
    pub username: String,
    pub count: i64,
}

/// Aggregate report over a filtered set of entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatLogStats {
    pub total_logs: i64,
    pub unique_users: i64,
    pub unique_conversations: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_quota: i64,
    pub top_models: Vec<NamedCount>,
    pub request_types: Vec<NamedCount>,
    pub top_users: Vec<UserCount>,
    pub duplicate_entries: i64,
    pub multiround_entries: i64,
    pub avg_conversation_length: f64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;

    pub(crate) fn entry() -> ChatLogEntry {
        let now = Utc::now();
        ChatLogEntry {
            id: 1,
            user_id: 1,
            username: "alice".into(),
            token_id: 1,
            token_name: "laptop".into(),
            model_name: "gpt-4o-mini".into(),
            channel_id: 1,
            channel_name: "openai".into(),
            request_type: "chat".into(),
            prompt_hash: "h".into(),
            prompt_content: "p".into(),
            system_prompt: String::new(),
            response_content: "r".into(),
            response_choices: None,
            finish_reason: "stop".into(),
            conversation_id: "c1".into(),
            message_count: 1,
            is_multiround: false,
            conversation_length: 2,
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            quota: 10,
            use_time_seconds: 0,
            is_stream: false,
            duplicate_count: 1,
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            request_id: "req".into(),
            user_ip: String::new(),
            user_agent: String::new(),
            other: None,
        }
    }

    #[test]
    fn test_empty_filter() {
        assert!(ChatLogFilter::default().is_empty());
        let filter = ChatLogFilter {
            model_name: Some(String::new()),
            ..Default::default()
        };
        assert!(filter.is_empty());
    }

    #[test]
    fn test_filter_model_substring_and_time_window() {
        let e = entry();
        let filter = ChatLogFilter {
            model_name: Some("4o".into()),
            start_time: Some(e.created_at - Duration::minutes(1)),
            end_time: Some(e.created_at + Duration::minutes(1)),
            ..Default::default()
        };
        assert!(filter.matches(&e));

        let filter = ChatLogFilter {
            min_duplicate_count: Some(2),
            ..Default::default()
        };
        assert!(!filter.matches(&e));
    }

    #[test]
    fn test_page_params_clamp() {
        let page = PageParams {
            page: 3,
            page_size: 500,
        };
        assert_eq!(page.limit(), 100);
        assert_eq!(page.offset(), 200);
        assert!(page.validate().is_err());
    }
}
