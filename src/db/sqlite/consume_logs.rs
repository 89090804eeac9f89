use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::{
    db::{error::DbResult, repos::ConsumeLogRepo},
    models::ConsumeLogEntry,
};

pub struct SqliteConsumeLogRepo {
    pool: SqlitePool,
}

impl SqliteConsumeLogRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsumeLogRepo for SqliteConsumeLogRepo {
    async fn log_batch(&self, entries: Vec<ConsumeLogEntry>) -> DbResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        // One transaction per batch. INSERT OR IGNORE keeps a retried batch
        // from double-logging a request id.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for entry in &entries {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO consume_logs (
                    user_id, token_id, channel_id, model_name, prompt_tokens,
                    completion_tokens, quota, use_time_seconds, is_stream, content,
                    request_id, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.user_id)
            .bind(entry.token_id)
            .bind(entry.channel_id)
            .bind(&entry.model_name)
            .bind(entry.prompt_tokens)
            .bind(entry.completion_tokens)
            .bind(entry.quota)
            .bind(entry.use_time_seconds)
            .bind(entry.is_stream)
            .bind(&entry.content)
            .bind(&entry.request_id)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn list_by_user(&self, user_id: i64, limit: i64) -> DbResult<Vec<ConsumeLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, token_id, channel_id, model_name, prompt_tokens, completion_tokens,
                   quota, use_time_seconds, is_stream, content, request_id, created_at
            FROM consume_logs
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> DbResult<ConsumeLogEntry> {
                Ok(ConsumeLogEntry {
                    user_id: row.try_get("user_id")?,
                    token_id: row.try_get("token_id")?,
                    channel_id: row.try_get("channel_id")?,
                    model_name: row.try_get("model_name")?,
                    prompt_tokens: row.try_get("prompt_tokens")?,
                    completion_tokens: row.try_get("completion_tokens")?,
                    quota: row.try_get("quota")?,
                    use_time_seconds: row.try_get("use_time_seconds")?,
                    is_stream: row.try_get("is_stream")?,
                    content: row.try_get("content")?,
                    request_id: row.try_get("request_id")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
