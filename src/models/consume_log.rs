use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Billing record written once per settled call.
///
/// `request_id` is unique; replaying the same settlement is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLogEntry {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    /// Human-readable breakdown of ratios and tool charges.
    pub content: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}
