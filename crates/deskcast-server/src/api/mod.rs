mod rtc;

use crate::state::AppState;
use crate::ws;
use axum::{response::Html, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const INDEX_HTML: &str = include_str!("index.html");

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Manual test page
        .route("/", get(|| async { Html(INDEX_HTML) }))
        // Health check
        .route("/health", get(|| async { "OK" }))
        // WebRTC configuration for viewers
        .route("/api/rtc/ice-servers", get(rtc::get_ice_servers))
        // Signaling endpoint
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaEngine, MediaSessionParts};
    use crate::state::Config;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct NoEngine;

    #[async_trait]
    impl MediaEngine for NoEngine {
        async fn create_session(&self, _session_id: Uuid) -> anyhow::Result<MediaSessionParts> {
            anyhow::bail!("no media engine in this test")
        }
    }

    fn router() -> Router {
        let config = Config::from_lookup(|key| match key {
            "STUN_SERVERS" => Some("stun:stun.example.org:3478".to_string()),
            "TURN_SERVERS" => Some("turn:turn.example.org:3478|viewer|hunter2".to_string()),
            _ => None,
        })
        .unwrap();
        create_router(AppState::new(
            config,
            Arc::new(NoEngine),
            CancellationToken::new(),
        ))
    }

    async fn get_body(uri: &str) -> (StatusCode, String) {
        let response = router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(get_body("/health").await, (StatusCode::OK, "OK".to_string()));
    }

    #[tokio::test]
    async fn test_index_page() {
        let (status, body) = get_body("/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("RTCPeerConnection"));
    }

    #[tokio::test]
    async fn test_ice_servers() {
        let (status, body) = get_body("/api/rtc/ice-servers").await;
        assert_eq!(status, StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        let servers = value["ice_servers"].as_array().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0]["urls"][0], "stun:stun.example.org:3478");
        assert!(servers[0]["username"].is_null());
        assert_eq!(servers[1]["username"], "viewer");
        assert_eq!(servers[1]["credential"], "hunter2");
    }
}
