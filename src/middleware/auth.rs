//! Bearer key authentication for the relay and chat log routes.
//!
//! The resolved [`Caller`] is stored as a request extension for handlers.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{AppState, auth::AuthError, relay::Caller};

fn authenticate(state: &AppState, req: &Request) -> Result<Caller, AuthError> {
    let caller = state.tokens.authenticate_headers(req.headers())?;
    tracing::debug!(
        user_id = caller.user_id,
        token_id = caller.token_id,
        "Request authenticated"
    );
    Ok(caller)
}

/// Any configured token.
pub async fn api_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let caller = authenticate(&state, &req)?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

/// A token whose user has `admin = true`.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let caller = authenticate(&state, &req)?;
    if !caller.admin {
        tracing::warn!(user_id = caller.user_id, "Non-admin token used on an admin route");
        return Err(AuthError::Forbidden("admin access required".into()));
    }
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
