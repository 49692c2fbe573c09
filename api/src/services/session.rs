//! Session management: JWT access tokens and refresh tokens
//!
//! Refresh tokens are single use. Rotation deletes the presented token and
//! issues its replacement in one read-write transaction, so a conflict between
//! two concurrent refreshes is retried instead of logging the user out.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::constants::{ACCESS_TOKEN_EXPIRY_MINUTES, REFRESH_TOKEN_EXPIRY_DAYS};
use crate::domain::sessions;
use crate::services::context::Context;
use crate::services::db::{PgBackend, Store};
use crate::services::error::{Error, Result};

/// JWT claims for access tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id as string
    pub exp: i64,    // expiry timestamp
    pub iat: i64,    // issued at
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    Expired,
}

/// Create a JWT access token valid for 10 minutes
pub fn create_access_token(user_id: i64, secret: &[u8]) -> Result<String, SessionError> {
    let now = Utc::now();
    let exp = now + Duration::minutes(ACCESS_TOKEN_EXPIRY_MINUTES);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|_| SessionError::InvalidToken)
}

/// Validate a JWT access token and return the user_id
pub fn validate_access_token(token: &str, secret: &[u8]) -> Result<i64, SessionError> {
    // HS256 only, so a token cannot pick its own algorithm
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub", "iat"]);

    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| {
            debug!("JWT decode error: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::InvalidToken,
            }
        })?;

    token_data
        .claims
        .sub
        .parse::<i64>()
        .map_err(|_| SessionError::InvalidToken)
}

/// Random 32-byte token as hex
fn generate_refresh_token() -> String {
    use rand::Rng;
    // ThreadRng is not Send; keep it out of any await
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes.as_slice())
}

/// Create a refresh token for `user_id`, inside the caller's transaction if
/// there is one.
pub async fn create_refresh_token<B: PgBackend>(
    ctx: &Context,
    store: &Store<B>,
    user_id: i64,
) -> Result<String> {
    let token = generate_refresh_token();
    let expires_at = Utc::now() + Duration::days(REFRESH_TOKEN_EXPIRY_DAYS);
    sessions::insert_refresh_token(&store.executor(ctx), &token, user_id, expires_at).await?;
    Ok(token)
}

/// Rotate a refresh token: consume the old token and issue a new one.
/// Returns (user_id, new_refresh_token) on success.
///
/// Fails with `NotFound` when the token is unknown, expired or already used.
pub async fn rotate_refresh_token<B: PgBackend>(
    ctx: &Context,
    store: &Store<B>,
    old_token: &str,
) -> Result<(i64, String)> {
    store
        .rw_tx(ctx, |ctx| {
            let store = store.clone();
            let old_token = old_token.to_string();
            async move {
                let db = store.executor(&ctx);
                let user_id = sessions::take_refresh_token(&db, &old_token, Utc::now())
                    .await?
                    .ok_or_else(|| Error::not_found("refresh token"))?;

                let new_token = create_refresh_token(&ctx, &store, user_id).await?;
                Ok((user_id, new_token))
            }
        })
        .await
}

/// Delete a specific refresh token (logout from one device)
pub async fn revoke_refresh_token<B: PgBackend>(
    ctx: &Context,
    store: &Store<B>,
    token: &str,
) -> Result<()> {
    sessions::delete_refresh_token(&store.executor(ctx), token).await?;
    Ok(())
}

/// Delete all refresh tokens of the user owning `token` (logout everywhere).
/// Returns the user and the number of tokens revoked.
pub async fn revoke_all_for_token<B: PgBackend>(
    ctx: &Context,
    store: &Store<B>,
    token: &str,
) -> Result<(i64, u64)> {
    store
        .rw_tx(ctx, |ctx| {
            let store = store.clone();
            let token = token.to_string();
            async move {
                let db = store.executor(&ctx);
                let user_id = sessions::find_token_owner(&db, &token)
                    .await?
                    .ok_or_else(|| Error::not_found("refresh token"))?;
                let revoked = sessions::delete_user_tokens(&db, user_id).await?;
                Ok((user_id, revoked))
            }
        })
        .await
}

/// Delete all refresh tokens for a user
pub async fn revoke_all_user_tokens<B: PgBackend>(
    ctx: &Context,
    store: &Store<B>,
    user_id: i64,
) -> Result<u64> {
    sessions::delete_user_tokens(&store.executor(ctx), user_id).await
}

/// Clean up expired refresh tokens (called periodically from main)
pub async fn cleanup_expired_tokens<B: PgBackend>(ctx: &Context, store: &Store<B>) -> Result<u64> {
    let removed = sessions::delete_expired_tokens(&store.executor(ctx), Utc::now()).await?;
    if removed > 0 {
        info!("[session] removed {} expired refresh tokens", removed);
    }
    Ok(removed)
}

// Hex encoding helper since we don't want to add another dependency
mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: &[u8]) -> String {
        let mut result = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}
