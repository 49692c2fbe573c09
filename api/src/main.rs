use axum::Router;
use log::{error, info};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

use session_api::AppState;
use session_api::config::{BackendKind, Config};
use session_api::constants::DEFAULT_CLEANUP_INTERVAL;
use session_api::routes;
use session_api::services::context::Context;
use session_api::services::db::{
    CockroachBackend, MySqlBackend, PgBackend, PostgresBackend, Store,
};
use session_api::services::session;

/// Periodically purge expired refresh tokens
async fn start_cleanup_scheduler<B: PgBackend>(store: Store<B>) {
    let mut interval = tokio::time::interval(DEFAULT_CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        let ctx = Context::background();
        if let Err(e) = session::cleanup_expired_tokens(&ctx, &store).await {
            error!("[scheduler] refresh token cleanup failed: {}", e);
        }
    }
}

async fn serve<B: PgBackend>(store: Store<B>, config: Config) {
    let state = Arc::new(AppState {
        store: store.clone(),
        jwt_secret: config.jwt_secret,
    });

    tokio::spawn(start_cleanup_scheduler(store));

    let app = routes::build_routes::<B>().with_state(state);
    listen(app, config.port).await
}

async fn listen(app: Router, port: u16) {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", addr, e));

    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await.expect("Server failed");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().expect("Invalid configuration");

    info!("Using {} backend", config.backend);

    match config.backend {
        BackendKind::Postgres => {
            let pool = connect_pg(&config).await;
            let backend =
                PostgresBackend::new(pool, config.retry).with_isolation(config.pg_isolation);
            serve(Store::new(backend), config).await
        }
        BackendKind::Cockroach => {
            let pool = connect_pg(&config).await;
            let backend = CockroachBackend::new(pool)
                .with_max_restarts(config.crdb_max_restarts)
                .with_restart_backoff(config.crdb_restart_backoff)
                .with_follower_reads(config.crdb_follower_reads);
            serve(Store::new(backend), config).await
        }
        BackendKind::MySql => {
            let pool = MySqlPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.database_url)
                .await
                .expect("Failed to connect to database");
            let state = Arc::new(AppState {
                store: Store::new(MySqlBackend::new(pool, config.retry)),
                jwt_secret: config.jwt_secret,
            });
            // session queries use Postgres placeholders
            info!("mysql backend serves /health only");
            let app = routes::health::routes::<MySqlBackend>().with_state(state);
            listen(app, config.port).await
        }
    }
}

async fn connect_pg(config: &Config) -> PgPool {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database")
}
