//! Chat log queries.
//!
//! User routes only ever see the caller's own entries. Admin routes accept a
//! [`ChatLogFilter`] in the query string.

use axum::{
    Extension, Json,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use axum_valid::Valid;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::ApiError;
use crate::{
    AppState,
    models::{
        ChatLogEntry, ChatLogFilter, ChatLogPage, ChatLogStats, DEFAULT_EXPORT_RECORDS,
        MAX_EXPORT_RECORDS, PageParams,
    },
    relay::Caller,
};

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct LimitParams {
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 100))]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct ExportParams {
    #[serde(default = "default_export_records")]
    #[validate(range(min = 1, max = 100000))]
    pub max_records: i64,
}

fn default_export_records() -> i64 {
    DEFAULT_EXPORT_RECORDS
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub data: Vec<ChatLogEntry>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: u64,
}

/// `GET /api/chat-logs`
pub async fn list_own(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Valid(Query(page)): Valid<Query<PageParams>>,
) -> Result<Json<ChatLogPage>, ApiError> {
    Ok(Json(state.chat_logger.list_by_user(caller.user_id, page).await?))
}

/// `GET /api/chat-logs/duplicates`
pub async fn own_duplicates(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Valid(Query(params)): Valid<Query<LimitParams>>,
) -> Result<Json<ListResponse>, ApiError> {
    let data = state
        .chat_logger
        .duplicates(Some(caller.user_id), params.limit)
        .await?;
    Ok(Json(ListResponse { data }))
}

/// `GET /api/chat-logs/longest`
pub async fn own_longest(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Valid(Query(params)): Valid<Query<LimitParams>>,
) -> Result<Json<ListResponse>, ApiError> {
    let data = state
        .chat_logger
        .longest(Some(caller.user_id), params.limit)
        .await?;
    Ok(Json(ListResponse { data }))
}

/// `GET /api/admin/chat-logs`
pub async fn admin_list(
    State(state): State<AppState>,
    Query(filter): Query<ChatLogFilter>,
    Valid(Query(page)): Valid<Query<PageParams>>,
) -> Result<Json<ChatLogPage>, ApiError> {
    Ok(Json(state.chat_logger.list(&filter, page).await?))
}

/// `GET /api/admin/chat-logs/stats`
pub async fn admin_stats(
    State(state): State<AppState>,
    Query(filter): Query<ChatLogFilter>,
) -> Result<Json<ChatLogStats>, ApiError> {
    Ok(Json(state.chat_logger.stats(&filter).await?))
}

/// `GET /api/admin/chat-logs/export`, as JSON Lines.
pub async fn admin_export(
    State(state): State<AppState>,
    Query(filter): Query<ChatLogFilter>,
    Valid(Query(params)): Valid<Query<ExportParams>>,
) -> Result<Response, ApiError> {
    let max_records = params.max_records.min(MAX_EXPORT_RECORDS);
    let body = state.chat_logger.export_jsonl(&filter, max_records).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"chat_logs.jsonl\"",
            ),
        ],
        body,
    )
        .into_response())
}

/// `DELETE /api/admin/chat-logs`. Refuses an empty filter.
pub async fn admin_delete(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(filter): Query<ChatLogFilter>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.chat_logger.delete(&filter).await?;
    tracing::info!(
        admin_user_id = caller.user_id,
        deleted,
        filter = ?filter,
        "Chat logs deleted"
    );
    Ok(Json(DeleteResponse { deleted }))
}
