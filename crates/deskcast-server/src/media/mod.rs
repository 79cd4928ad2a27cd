//! Media engine seam
//!
//! The relay never touches the secure transport directly. Every viewer gets a
//! [`MediaSession`] for negotiation, a [`PacketSink`] for delivery, and a
//! stream of [`MediaEvent`]s pushed by the engine.

mod rtc;

pub use rtc::{vp8_capability, WebRtcEngine};

use crate::error::SinkError;
use async_trait::async_trait;
use deskcast_protocol::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One RTP packet of the ingested stream
pub type Packet = webrtc::rtp::packet::Packet;

/// Write-only handle delivering packets into one viewer's media session
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn write_packet(&self, packet: &Packet) -> Result<(), SinkError>;
}

/// Negotiation surface of one viewer's media session
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Apply the remote offer and return the local answer, already applied
    async fn accept_offer(&self, offer: SessionDescription) -> anyhow::Result<SessionDescription>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Connection state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl MediaState {
    /// No packets will flow again once a session reaches one of these
    pub fn is_terminal(&self) -> bool {
        matches!(self, MediaState::Failed | MediaState::Closed)
    }
}

/// Notifications pushed by the engine, independent of inbound signaling
#[derive(Debug, Clone)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    StateChanged(MediaState),
}

/// Everything the engine hands back for a new viewer
pub struct MediaSessionParts {
    pub session: Arc<dyn MediaSession>,
    pub sink: Arc<dyn PacketSink>,
    pub events: mpsc::UnboundedReceiver<MediaEvent>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_session(&self, session_id: Uuid) -> anyhow::Result<MediaSessionParts>;
}
