use crate::state::AppState;
use axum::{extract::State, Json};
use deskcast_protocol::IceServer;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

/// Rendezvous servers a viewer should configure on its own peer connection
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let mut ice_servers = vec![];

    for stun_url in &state.config.stun_servers {
        ice_servers.push(IceServer {
            urls: vec![stun_url.clone()],
            username: None,
            credential: None,
        });
    }

    for turn in &state.config.turn_servers {
        ice_servers.push(IceServer {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });
    }

    Json(IceServersResponse { ice_servers })
}
