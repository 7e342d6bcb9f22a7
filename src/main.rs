use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use wa_relay::app::build_router;
use wa_relay::types::{AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let port = config.port;
    let state = Arc::new(AppState::new(config)?);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("wa-relay listening at http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
