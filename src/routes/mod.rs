pub mod chat_logs;
mod error;
pub mod health;
pub mod relay;

use axum::{
    Router, middleware,
    routing::{get, post},
};
pub use error::ApiError;

use crate::{
    AppState,
    middleware::{admin_auth_middleware, api_auth_middleware},
};

/// OpenAI-compatible relay endpoints, mounted under `/v1`.
pub fn relay_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(relay::relay))
        .route("/completions", post(relay::relay))
        .route("/embeddings", post(relay::relay))
        .route("/moderations", post(relay::relay))
        .route("/edits", post(relay::relay))
        .route("/responses", post(relay::relay))
        .route_layer(middleware::from_fn_with_state(state, api_auth_middleware))
}

/// Chat log endpoints, mounted under `/api`.
///
/// User routes are scoped to the caller; admin routes require an admin user.
pub fn chat_log_routes(state: AppState) -> Router<AppState> {
    let user = Router::new()
        .route("/chat-logs", get(chat_logs::list_own))
        .route("/chat-logs/duplicates", get(chat_logs::own_duplicates))
        .route("/chat-logs/longest", get(chat_logs::own_longest))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_auth_middleware,
        ));

    let admin = Router::new()
        .route(
            "/chat-logs",
            get(chat_logs::admin_list).delete(chat_logs::admin_delete),
        )
        .route("/chat-logs/stats", get(chat_logs::admin_stats))
        .route("/chat-logs/export", get(chat_logs::admin_export))
        .route_layer(middleware::from_fn_with_state(state, admin_auth_middleware));

    user.nest("/admin", admin)
}
