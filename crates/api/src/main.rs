use std::sync::Arc;

use anyhow::Context;

use stockledger_api::app::{self, services};
use stockledger_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load configuration")?;
    stockledger_observability::init_with(&settings.log);

    let services = Arc::new(services::build_services(&settings).await?);
    // Replays the outbox through the store, which blocks on the runtime.
    let (background, background_settings) = (services.clone(), settings.clone());
    tokio::task::spawn_blocking(move || background.start_background(&background_settings)).await??;

    let app = app::build_app(services.clone());

    let address = settings.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    tracing::info!(address = %listener.local_addr()?, environment = %settings.environment, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
