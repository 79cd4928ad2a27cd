//! Deskcast Server Library
//!
//! Fans one ingested VP8/RTP stream out to any number of WebRTC viewers.
//! Exposed as a library for testing and embedding.

pub mod api;
pub mod error;
pub mod media;
pub mod relay;
pub mod state;
pub mod ws;

use anyhow::{Context, Result};
use media::MediaEngine;
use relay::{Broadcaster, IngestListener};
use state::{AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Create the HTTP router for the given application state
pub fn create_app(state: AppState) -> axum::Router {
    api::create_router(state)
}

/// Both listeners bound and ready to serve
pub struct Server {
    state: AppState,
    http: TcpListener,
    ingest: IngestListener,
}

impl Server {
    /// Bind the signaling and ingest sockets. Either failing is fatal.
    pub async fn bind(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let http = TcpListener::bind(config.bind_address)
            .await
            .with_context(|| format!("failed to bind signaling address {}", config.bind_address))?;
        let ingest = IngestListener::bind(config.ingest_address).await?;

        Ok(Self {
            state: AppState::new(config, engine, shutdown),
            http,
            ingest,
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        Ok(self.ingest.local_addr()?)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until the shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let Server {
            state,
            http,
            ingest,
        } = self;
        let shutdown = state.shutdown.clone();
        let sessions = state.sessions.clone();

        tracing::info!("Signaling on {}", http.local_addr()?);
        tracing::info!("RTP ingest on {}", ingest.local_addr()?);

        let broadcaster = Arc::new(Broadcaster::new(state.registry.clone()));
        let ingest_task = tokio::spawn(ingest.run(broadcaster, shutdown.clone()));

        let app = create_app(state);
        let served = axum::serve(http, app)
            .with_graceful_shutdown({
                let shutdown = shutdown.clone();
                async move { shutdown.cancelled().await }
            })
            .await;

        // Stop ingest and viewers even when the HTTP server failed on its own
        shutdown.cancel();
        if let Err(e) = ingest_task.await {
            tracing::error!("Ingest task panicked: {}", e);
        }

        // Upgraded websockets outlive graceful shutdown; wait for their teardown
        sessions.close();
        tracing::info!("Waiting for {} viewer sessions to close", sessions.len());
        sessions.wait().await;

        served.context("signaling server failed")?;
        tracing::info!("Server stopped");
        Ok(())
    }
}
