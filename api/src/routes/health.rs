//! Liveness endpoint (/health)

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use std::sync::Arc;

use super::request_context;
use crate::AppState;
use crate::services::context::Context;
use crate::services::db::{Backend, Executor, Ping, PoolSource};
use crate::services::error::LogKind;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub read_only: bool,
}

pub fn routes<B>() -> Router<Arc<AppState<B>>>
where
    B: Backend + PoolSource,
    Executor<B::Db>: Ping + Send + Sync,
{
    Router::new().route("/health", get(health::<B>))
}

/// GET /health - round trip to the database, in a read-only transaction when
/// the backend has them
async fn health<B>(State(state): State<Arc<AppState<B>>>) -> Result<Json<HealthResponse>, StatusCode>
where
    B: Backend + PoolSource,
    Executor<B::Db>: Ping + Send + Sync,
{
    let ctx = request_context();
    let store = &state.store;
    let read_only = store.backend().supports_read_only();

    let ping = |ctx: Context| {
        let store = store.clone();
        async move {
            let db = store.executor(&ctx);
            db.ping().await
        }
    };
    let result = if read_only {
        store.ro_tx(&ctx, ping).await
    } else {
        ping(ctx).await
    };
    result.log_kind("Health check failed")?;

    Ok(Json(HealthResponse {
        status: "ok",
        backend: store.backend().name(),
        read_only,
    }))
}
