//! Atrium server binary

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use atrium_server::config::Config;
use atrium_server::state::AppState;
use atrium_server::{app, init_schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("atrium_server=debug,tower_http=info")),
        )
        .init();

    let config = Config::from_env();

    let options = SqliteConnectOptions::from_str(&config.database.url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    init_schema(&pool).await?;

    let state = AppState::new(pool);
    let router = app(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Atrium server listening on {}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
