use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, query::Query, sqlite::SqliteArguments, sqlite::SqliteRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::ChatLogRepo,
    },
    models::{
        ChatLogEntry, ChatLogFilter, ChatLogPage, ChatLogStats, ConversationUpdate, NamedCount,
        PageParams, STATS_TOP_N, UserCount,
    },
};

const COLUMNS: &str = "\
    id, user_id, username, token_id, token_name, model_name, channel_id, channel_name, \
    request_type, prompt_hash, prompt_content, system_prompt, response_content, \
    response_choices, finish_reason, conversation_id, message_count, is_multiround, \
    conversation_length, prompt_tokens, completion_tokens, total_tokens, quota, \
    use_time_seconds, is_stream, duplicate_count, first_seen_at, last_seen_at, created_at, \
    request_id, user_ip, user_agent, other";

pub struct SqliteChatLogRepo {
    pool: SqlitePool,
}

impl SqliteChatLogRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &SqliteRow) -> DbResult<ChatLogEntry> {
        let json = |column: &str| -> DbResult<Option<Value>> {
            let raw: Option<String> = row.try_get(column)?;
            Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
        };

        Ok(ChatLogEntry {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            token_id: row.try_get("token_id")?,
            token_name: row.try_get("token_name")?,
            model_name: row.try_get("model_name")?,
            channel_id: row.try_get("channel_id")?,
            channel_name: row.try_get("channel_name")?,
            request_type: row.try_get("request_type")?,
            prompt_hash: row.try_get("prompt_hash")?,
            prompt_content: row.try_get("prompt_content")?,
            system_prompt: row.try_get("system_prompt")?,
            response_content: row.try_get("response_content")?,
            response_choices: json("response_choices")?,
            finish_reason: row.try_get("finish_reason")?,
            conversation_id: row.try_get("conversation_id")?,
            message_count: row.try_get("message_count")?,
            is_multiround: row.try_get("is_multiround")?,
            conversation_length: row.try_get("conversation_length")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            total_tokens: row.try_get("total_tokens")?,
            quota: row.try_get("quota")?,
            use_time_seconds: row.try_get("use_time_seconds")?,
            is_stream: row.try_get("is_stream")?,
            duplicate_count: row.try_get("duplicate_count")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            created_at: row.try_get("created_at")?,
            request_id: row.try_get("request_id")?,
            user_ip: row.try_get("user_ip")?,
            user_agent: row.try_get("user_agent")?,
            other: json("other")?,
        })
    }

    async fn fetch_entries(
        &self,
        sql: &str,
        params: &[Param],
    ) -> DbResult<Vec<ChatLogEntry>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn count(&self, where_clause: &str, params: &[Param]) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) AS count FROM chat_logs {where_clause}");
        let row = bind_all(sqlx::query(&sql), params)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn paged(
        &self,
        where_clause: String,
        mut params: Vec<Param>,
        page: PageParams,
    ) -> DbResult<ChatLogPage> {
        let total = self.count(&where_clause, &params).await?;

        let sql = format!(
            "SELECT {COLUMNS} FROM chat_logs {where_clause} ORDER BY id DESC LIMIT ? OFFSET ?"
        );
        params.push(Param::Int(page.limit()));
        params.push(Param::Int(page.offset()));
        let items = self.fetch_entries(&sql, &params).await?;

        Ok(ChatLogPage {
            items,
            total,
            page: page.page.max(1),
            page_size: page.limit(),
        })
    }

    async fn ranked(
        &self,
        column: &str,
        where_clause: &str,
        params: &[Param],
        limit: Option<i64>,
    ) -> DbResult<Vec<NamedCount>> {
        let limit_clause = limit.map(|l| format!("LIMIT {l}")).unwrap_or_default();
        let sql = format!(
            "SELECT {column} AS name, COUNT(*) AS count FROM chat_logs {where_clause} \
             GROUP BY {column} ORDER BY count DESC, name ASC {limit_clause}"
        );
        let rows = bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> DbResult<NamedCount> {
                Ok(NamedCount {
                    name: row.try_get("name")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }
}

/// A bound value in a dynamically built WHERE clause.
enum Param {
    Int(i64),
    Text(String),
    Time(DateTime<Utc>),
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Param],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Param::Int(v) => query.bind(*v),
            Param::Text(v) => query.bind(v.as_str()),
            Param::Time(v) => query.bind(*v),
        };
    }
    query
}

fn filter_clause(filter: &ChatLogFilter) -> (String, Vec<Param>) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    if let Some(user_id) = filter.user_id {
        conditions.push("user_id = ?");
        params.push(Param::Int(user_id));
    }
    if let Some(model) = filter.model_name.as_deref().filter(|m| !m.is_empty()) {
        conditions.push("instr(model_name, ?) > 0");
        params.push(Param::Text(model.to_string()));
    }
    if let Some(request_type) = filter.request_type.as_deref().filter(|t| !t.is_empty()) {
        conditions.push("request_type = ?");
        params.push(Param::Text(request_type.to_string()));
    }
    if let Some(conversation_id) = filter.conversation_id.as_deref().filter(|c| !c.is_empty()) {
        conditions.push("conversation_id = ?");
        params.push(Param::Text(conversation_id.to_string()));
    }
    if let Some(min) = filter.min_duplicate_count {
        conditions.push("duplicate_count >= ?");
        params.push(Param::Int(min));
    }
    if let Some(start) = filter.start_time {
        conditions.push("created_at >= ?");
        params.push(Param::Time(start));
    }
    if let Some(end) = filter.end_time {
        conditions.push("created_at <= ?");
        params.push(Param::Time(end));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (where_clause, params)
}

fn user_clause(user_id: Option<i64>, base: &str) -> (String, Vec<Param>) {
    match user_id {
        Some(id) => (format!("WHERE {base} AND user_id = ?"), vec![Param::Int(id)]),
        None => (format!("WHERE {base}"), Vec::new()),
    }
}

#[async_trait]
impl ChatLogRepo for SqliteChatLogRepo {
    async fn append(&self, entry: ChatLogEntry) -> DbResult<i64> {
        let response_choices = entry
            .response_choices
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let other = entry.other.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO chat_logs (
                user_id, username, token_id, token_name, model_name, channel_id, channel_name,
                request_type, prompt_hash, prompt_content, system_prompt, response_content,
                response_choices, finish_reason, conversation_id, message_count, is_multiround,
                conversation_length, prompt_tokens, completion_tokens, total_tokens, quota,
                use_time_seconds, is_stream, duplicate_count, first_seen_at, last_seen_at,
                created_at, request_id, user_ip, user_agent, other
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.username)
        .bind(entry.token_id)
        .bind(&entry.token_name)
        .bind(&entry.model_name)
        .bind(entry.channel_id)
        .bind(&entry.channel_name)
        .bind(&entry.request_type)
        .bind(&entry.prompt_hash)
        .bind(&entry.prompt_content)
        .bind(&entry.system_prompt)
        .bind(&entry.response_content)
        .bind(response_choices)
        .bind(&entry.finish_reason)
        .bind(&entry.conversation_id)
        .bind(entry.message_count)
        .bind(entry.is_multiround)
        .bind(entry.conversation_length)
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(entry.total_tokens)
        .bind(entry.quota)
        .bind(entry.use_time_seconds)
        .bind(entry.is_stream)
        .bind(entry.duplicate_count)
        .bind(entry.first_seen_at)
        .bind(entry.last_seen_at)
        .bind(entry.created_at)
        .bind(&entry.request_id)
        .bind(&entry.user_ip)
        .bind(&entry.user_agent)
        .bind(other)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_by_prompt_hash(
        &self,
        user_id: i64,
        prompt_hash: &str,
    ) -> DbResult<Option<ChatLogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM chat_logs WHERE user_id = ? AND prompt_hash = ? ORDER BY id ASC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(prompt_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn record_duplicate(&self, id: i64, seen_at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE chat_logs SET duplicate_count = duplicate_count + 1, last_seen_at = ? WHERE id = ?",
        )
        .bind(seen_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn list_by_conversation(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> DbResult<Vec<ChatLogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM chat_logs WHERE conversation_id = ? AND user_id = ? ORDER BY id ASC"
        );
        self.fetch_entries(
            &sql,
            &[
                Param::Text(conversation_id.to_string()),
                Param::Int(user_id),
            ],
        )
        .await
    }

    async fn update_conversation_fields(&self, updates: &[ConversationUpdate]) -> DbResult<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for update in updates {
            sqlx::query(
                "UPDATE chat_logs SET is_multiround = ?, conversation_length = ? WHERE id = ?",
            )
            .bind(update.is_multiround)
            .bind(update.conversation_length)
            .bind(update.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_by_user(&self, user_id: i64, page: PageParams) -> DbResult<ChatLogPage> {
        self.paged("WHERE user_id = ?".into(), vec![Param::Int(user_id)], page)
            .await
    }

    async fn list_duplicates(
        &self,
        user_id: Option<i64>,
        limit: i64,
    ) -> DbResult<Vec<ChatLogEntry>> {
        let (where_clause, mut params) = user_clause(user_id, "duplicate_count > 1");
        let sql = format!(
            "SELECT {COLUMNS} FROM chat_logs {where_clause} \
             ORDER BY duplicate_count DESC, last_seen_at DESC LIMIT ?"
        );
        params.push(Param::Int(limit));
        self.fetch_entries(&sql, &params).await
    }

    async fn list_longest(&self, user_id: Option<i64>, limit: i64) -> DbResult<Vec<ChatLogEntry>> {
        let (where_clause, mut params) = user_clause(user_id, "is_multiround = 1");
        let sql = format!(
            "SELECT {COLUMNS} FROM chat_logs {where_clause} \
             ORDER BY conversation_length DESC, id DESC LIMIT ?"
        );
        params.push(Param::Int(limit));
        self.fetch_entries(&sql, &params).await
    }

    async fn list(&self, filter: &ChatLogFilter, page: PageParams) -> DbResult<ChatLogPage> {
        let (where_clause, params) = filter_clause(filter);
        self.paged(where_clause, params, page).await
    }

    async fn stats(&self, filter: &ChatLogFilter) -> DbResult<ChatLogStats> {
        let (where_clause, params) = filter_clause(filter);

        let sql = format!(
            r#"
            SELECT
                COUNT(*) AS total_logs,
                COUNT(DISTINCT user_id) AS unique_users,
                COUNT(DISTINCT NULLIF(conversation_id, '')) AS unique_conversations,
                COALESCE(SUM(prompt_tokens), 0) AS total_prompt_tokens,
                COALESCE(SUM(completion_tokens), 0) AS total_completion_tokens,
                COALESCE(SUM(quota), 0) AS total_quota,
                COALESCE(SUM(CASE WHEN duplicate_count > 1 THEN 1 ELSE 0 END), 0) AS duplicate_entries,
                COALESCE(SUM(CASE WHEN is_multiround = 1 THEN 1 ELSE 0 END), 0) AS multiround_entries,
                COALESCE(AVG(conversation_length), 0.0) AS avg_conversation_length
            FROM chat_logs {where_clause}
            "#
        );
        let row = bind_all(sqlx::query(&sql), &params)
            .fetch_one(&self.pool)
            .await?;

        let total_logs: i64 = row.try_get("total_logs")?;
        if total_logs == 0 {
            return Ok(ChatLogStats::default());
        }

        let top_models = self
            .ranked("model_name", &where_clause, &params, Some(STATS_TOP_N))
            .await?;
        let request_types = self
            .ranked("request_type", &where_clause, &params, None)
            .await?;

        let users_sql = format!(
            "SELECT user_id, MAX(username) AS username, COUNT(*) AS count FROM chat_logs \
             {where_clause} GROUP BY user_id ORDER BY count DESC, user_id ASC LIMIT {STATS_TOP_N}"
        );
        let top_users = bind_all(sqlx::query(&users_sql), &params)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| -> DbResult<UserCount> {
                Ok(UserCount {
                    user_id: row.try_get("user_id")?,
                    username: row.try_get("username")?,
                    count: row.try_get("count")?,
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        Ok(ChatLogStats {
            total_logs,
            unique_users: row.try_get("unique_users")?,
            unique_conversations: row.try_get("unique_conversations")?,
            total_prompt_tokens: row.try_get("total_prompt_tokens")?,
            total_completion_tokens: row.try_get("total_completion_tokens")?,
            total_quota: row.try_get("total_quota")?,
            top_models,
            request_types,
            top_users,
            duplicate_entries: row.try_get("duplicate_entries")?,
            multiround_entries: row.try_get("multiround_entries")?,
            avg_conversation_length: row.try_get("avg_conversation_length")?,
        })
    }

    async fn delete(&self, filter: &ChatLogFilter) -> DbResult<u64> {
        if filter.is_empty() {
            return Err(DbError::Validation(
                "at least one filter condition is required".into(),
            ));
        }
        let (where_clause, params) = filter_clause(filter);
        let sql = format!("DELETE FROM chat_logs {where_clause}");
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn export(
        &self,
        filter: &ChatLogFilter,
        max_records: i64,
    ) -> DbResult<Vec<ChatLogEntry>> {
        let (where_clause, mut params) = filter_clause(filter);
        let sql = format!("SELECT {COLUMNS} FROM chat_logs {where_clause} ORDER BY id DESC LIMIT ?");
        params.push(Param::Int(max_records));
        self.fetch_entries(&sql, &params).await
    }
}
