mod routes;

use std::sync::Arc;

use ariane_core::dispatch::Dispatcher;
use ariane_core::github::ClientPool;
use ariane_core::server_config::{ServerConfig, SERVER_CONFIG_PATH};
use tracing::info;

use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ariane_core=info,ariane_server=info,tower_http=warn".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::read(SERVER_CONFIG_PATH)?;

    let pool = Arc::new(ClientPool::new(&config.github, config.client.timeout)?);
    let dispatcher = Dispatcher::new(
        pool,
        config.client.run_delay,
        config.client.max_retry_attempts,
    );

    let state = Arc::new(AppState {
        dispatcher,
        webhook_secret: config.github.app.webhook_secret.clone(),
        version: config.version.clone(),
    });

    let addr = format!("{}:{}", config.server.address, config.server.port);
    info!("starting server on {addr}...");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, routes::router(state)).await?;

    Ok(())
}
