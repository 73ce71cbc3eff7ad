//! Serve stored phone number records over HTTP.
use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};

use phone_common::lifecycle::{init_tracing, shutdown_token};
use phone_common::metrics::{serve, setup_metrics_routes};
use phone_common::store::PgStore;

mod config;
mod handlers;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let pool = config
        .pool
        .connect()
        .await
        .wrap_err("failed to connect to the database")?;
    let store = PgStore::new(config.table_name.as_str(), pool).wrap_err("invalid table name")?;

    let state = handlers::AppState {
        store: Arc::new(store),
        scan_limit: config.scan_limit.0,
    };
    let app = handlers::add_routes(Router::new(), state, config.concurrency_limit);
    let app = setup_metrics_routes(app)?;

    let shutdown = shutdown_token()?;
    tracing::info!("serving records on {}", config.bind());
    serve(app, &config.bind(), shutdown)
        .await
        .wrap_err("failed to serve phone-api")?;

    Ok(())
}
