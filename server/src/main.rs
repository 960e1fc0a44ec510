//! Custody Server - reference remote backend for the custody sync engine.
//!
//! Holds the system-of-record copy of every record and serves the HTTP
//! protocol spoken by `custody_engine::HttpRemote`: per-record writes under
//! `/tables` and a change feed under `/changes`. Writes are accepted with the
//! engine's own last-write-wins rule, so client and server always agree on
//! which version wins.

mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod routes;

use crate::config::Config;
use crate::db::Pool;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "custody_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let addr = config.bind_addr();

    tracing::info!(%addr, auth = config.auth_secret.is_some(), "starting custody server");

    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("running database migrations");
    db::run_migrations(&pool).await?;

    let state = AppState {
        pool,
        config: Arc::new(config),
    };
    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
