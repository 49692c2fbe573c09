pub mod auth;
pub mod health;

use axum::Router;
use std::sync::Arc;

use crate::AppState;
use crate::constants::REQUEST_TIMEOUT;
use crate::services::context::Context;
use crate::services::db::PgBackend;

/// Build all routes for the API
pub fn build_routes<B: PgBackend>() -> Router<Arc<AppState<B>>> {
    Router::new()
        .merge(auth::routes::<B>())
        .merge(health::routes::<B>())
}

/// Root context of one inbound request
pub(crate) fn request_context() -> Context {
    Context::background().with_timeout(REQUEST_TIMEOUT)
}
