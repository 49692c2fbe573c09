//! User domain - DB queries for users

use sqlx::Postgres;

use crate::services::db::Executor;
use crate::services::error::Result;

#[derive(Debug, sqlx::FromRow)]
pub struct UserBasicInfo {
    pub id: i64,
    pub username: String,
}

/// Get basic user info by ID
pub async fn get_user_by_id(db: &Executor<Postgres>, user_id: i64) -> Result<Option<UserBasicInfo>> {
    db.fetch_optional(sqlx::query_as("SELECT id, username FROM users WHERE id = $1").bind(user_id))
        .await
}
