use anyhow::Result;
use deskcast_server::{media::WebRtcEngine, state::Config, Server};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deskcast_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Deskcast server...");

    // Load configuration
    let config = Config::load()?;

    // Build the media engine
    let engine = Arc::new(WebRtcEngine::new(&config)?);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    });

    // Start the server
    let server = Server::bind(config, engine, shutdown).await?;
    server.run().await
}
