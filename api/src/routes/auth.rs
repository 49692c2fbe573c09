//! Authentication and session management endpoints

use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
    routing::{get, post},
};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::request_context;
use crate::AppState;
use crate::domain::users;
use crate::services::context::Context;
use crate::services::db::PgBackend;
use crate::services::error::{ErrorKind, LogErr, LogKind, Result};
use crate::services::session;

pub fn routes<B: PgBackend>() -> Router<Arc<AppState<B>>> {
    Router::new()
        .route("/auth/refresh", post(refresh_session::<B>))
        .route("/auth/logout", post(logout::<B>))
        .route("/auth/me", get(get_me::<B>))
}

// ============================================================================
// Auth Extractor - validates the Bearer access token and extracts user_id
// ============================================================================

pub struct AuthUser(pub i64);

impl<B: PgBackend> FromRequestParts<Arc<AppState<B>>> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState<B>>,
    ) -> Result<Self, Self::Rejection> {
        let access_token = bearer_token(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)?;

        let user_id = session::validate_access_token(access_token, &state.jwt_secret)
            .log_status("JWT validation failed", StatusCode::UNAUTHORIZED)?;

        Ok(AuthUser(user_id))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
}

/// POST /auth/refresh - Exchange a refresh token for a new access token.
/// Implements refresh token rotation: old token is invalidated, new one is issued
async fn refresh_session<B: PgBackend>(
    State(state): State<Arc<AppState<B>>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, StatusCode> {
    let ctx = request_context();

    // Unknown, expired and already used tokens are expected for stale sessions
    let (user_id, refresh_token) =
        match session::rotate_refresh_token(&ctx, &state.store, &body.refresh_token).await {
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StatusCode::UNAUTHORIZED),
            other => other.log_kind("Refresh token rotation failed")?,
        };

    let access_token = session::create_access_token(user_id, &state.jwt_secret)
        .log_500("Failed to create access token")?;

    Ok(Json(TokenResponse {
        user_id,
        access_token,
        refresh_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
    /// Revoke every session of the token's owner, not just this one
    #[serde(default)]
    pub everywhere: bool,
}

/// POST /auth/logout - Revoke one refresh token, or all of its owner's
async fn logout<B: PgBackend>(
    State(state): State<Arc<AppState<B>>>,
    Json(body): Json<LogoutRequest>,
) -> StatusCode {
    let ctx = request_context();

    // Logout never fails from the client's point of view
    if let Err(e) = revoke(&ctx, &state, &body).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to revoke refresh token during logout: {}", e);
        }
    }

    StatusCode::NO_CONTENT
}

async fn revoke<B: PgBackend>(
    ctx: &Context,
    state: &AppState<B>,
    body: &LogoutRequest,
) -> Result<()> {
    if body.everywhere {
        session::revoke_all_for_token(ctx, &state.store, &body.refresh_token).await?;
    } else {
        session::revoke_refresh_token(ctx, &state.store, &body.refresh_token).await?;
    }
    Ok(())
}

#[derive(Serialize)]
struct MeResponse {
    id: i64,
    username: String,
}

/// GET /auth/me - Get current user info (validates session)
async fn get_me<B: PgBackend>(
    State(state): State<Arc<AppState<B>>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<MeResponse>, StatusCode> {
    let ctx = request_context();
    let store = &state.store;

    let user = store
        .ro_tx(&ctx, |ctx| {
            let store = store.clone();
            async move { users::get_user_by_id(&store.executor(&ctx), user_id).await }
        })
        .await
        .log_kind("Get user by ID error")?;

    // Return 401 if user not found - a valid JWT for a deleted user is still unauthorized
    let user = user.ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(Json(MeResponse {
        id: user.id,
        username: user.username,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_logout_defaults_to_single_session() {
        let body: LogoutRequest = serde_json::from_str(r#"{"refresh_token":"abc"}"#).unwrap();
        assert!(!body.everywhere);

        let body: LogoutRequest =
            serde_json::from_str(r#"{"refresh_token":"abc","everywhere":true}"#).unwrap();
        assert!(body.everywhere);
    }
}
