//! Codecheck intake server

use std::sync::Arc;

use anyhow::{Context, Result};
use codecheck_intake::{create_router, AppState, CommandEngine, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codecheck_intake=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;

    info!("Starting Codecheck intake...");
    info!(
        "Grading engine: {:?} (timeout {}s, {} concurrent checks)",
        config.engine_command,
        config.engine_timeout.as_secs(),
        config.max_concurrent_checks
    );
    if config.callback_downgrade_https {
        info!("Score callbacks to https:// targets will be sent over plain http");
    }

    let engine = CommandEngine::new(&config.engine_command)?;
    let addr = config.listen_address();
    let state = AppState::new(config, Arc::new(engine))?;
    let app = create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Codecheck intake running on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
