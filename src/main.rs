mod config;
mod db;
mod engine;
mod error;
mod middleware;
mod models;
mod routes;
mod store;

use std::sync::Arc;

use crate::{
    config::Config,
    models::AppState,
    store::{MemoryStore, PgStore, Store},
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::{HeaderName, header};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;

    let store: Arc<dyn Store> = match &cfg.database_url {
        Some(url) => Arc::new(PgStore::new(db::connect_pg(url, cfg.db_max_connections).await?)),
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store (data is lost on exit)");
            Arc::new(MemoryStore::new())
        }
    };

    tracing::info!(
        open = %cfg.policy.open,
        close = %cfg.policy.close,
        slot_minutes = cfg.policy.slot_minutes,
        closed_weekday = ?cfg.policy.closed_weekday,
        "calendar policy loaded"
    );

    let state = AppState {
        store,
        policy: cfg.policy.clone(),
        invoice_number_attempts: cfg.invoice_number_attempts,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-staff-id"),
            HeaderName::from_static("x-staff-role"),
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
