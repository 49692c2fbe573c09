//! Refresh token domain - DB queries for refresh_tokens
//!
//! Every function takes the [`Executor`] resolved from the caller's context, so
//! the same query runs inside the active transaction when there is one and on
//! the pool otherwise.

use chrono::{DateTime, Utc};
use sqlx::Postgres;

use crate::services::db::Executor;
use crate::services::error::Result;

pub async fn insert_refresh_token(
    db: &Executor<Postgres>,
    token: &str,
    user_id: i64,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    db.execute(
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at),
    )
    .await?;

    Ok(())
}

/// Delete an unexpired token and return its owner.
///
/// Two requests presenting the same token race on the DELETE; only one of them
/// gets the row back.
pub async fn take_refresh_token(
    db: &Executor<Postgres>,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = db
        .fetch_optional(
            sqlx::query_as(
                r#"
                DELETE FROM refresh_tokens
                WHERE id = $1 AND expires_at > $2
                RETURNING user_id
                "#,
            )
            .bind(token)
            .bind(now),
        )
        .await?;

    Ok(row.map(|(user_id,)| user_id))
}

pub async fn find_token_owner(db: &Executor<Postgres>, token: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = db
        .fetch_optional(sqlx::query_as("SELECT user_id FROM refresh_tokens WHERE id = $1").bind(token))
        .await?;

    Ok(row.map(|(user_id,)| user_id))
}

pub async fn delete_refresh_token(db: &Executor<Postgres>, token: &str) -> Result<u64> {
    let result = db
        .execute(sqlx::query("DELETE FROM refresh_tokens WHERE id = $1").bind(token))
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_user_tokens(db: &Executor<Postgres>, user_id: i64) -> Result<u64> {
    let result = db
        .execute(sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1").bind(user_id))
        .await?;

    Ok(result.rows_affected())
}

pub async fn delete_expired_tokens(db: &Executor<Postgres>, now: DateTime<Utc>) -> Result<u64> {
    let result = db
        .execute(sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1").bind(now))
        .await?;

    Ok(result.rows_affected())
}
