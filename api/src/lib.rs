pub mod config;
pub mod constants;
pub mod domain;
pub mod routes;
pub mod services;

use services::db::Store;

/// Shared state of the HTTP surface
pub struct AppState<B> {
    pub store: Store<B>,
    pub jwt_secret: Vec<u8>,
}
