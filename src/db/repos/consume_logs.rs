use async_trait::async_trait;

use crate::{db::error::DbResult, models::ConsumeLogEntry};

#[async_trait]
pub trait ConsumeLogRepo: Send + Sync {
    /// Insert entries, skipping request ids that were already logged.
    /// Returns the number of rows inserted.
    async fn log_batch(&self, entries: Vec<ConsumeLogEntry>) -> DbResult<usize>;

    /// A user's most recent entries, newest first.
    async fn list_by_user(&self, user_id: i64, limit: i64) -> DbResult<Vec<ConsumeLogEntry>>;
}
