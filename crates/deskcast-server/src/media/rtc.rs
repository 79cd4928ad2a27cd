//! webrtc-rs backed media engine
//!
//! One shared `API` with a single VP8 codec registration. Each viewer gets a
//! peer connection carrying one `TrackLocalStaticRTP`, so ingested RTP packets
//! are forwarded without repacketization.

use super::{
    MediaEngine, MediaEvent, MediaSession, MediaSessionParts, MediaState, Packet, PacketSink,
};
use crate::error::SinkError;
use crate::state::Config;
use anyhow::Result;
use async_trait::async_trait;
use deskcast_protocol::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

/// Dynamic payload type the ingest stream is expected to use for VP8
const VP8_PAYLOAD_TYPE: u8 = 96;

/// Codec capability advertised to viewers; must match the registration exactly
pub fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

pub struct WebRtcEngine {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let mut codecs = CodecRegistry::default();
        codecs.register_codec(
            RTCRtpCodecParameters {
                capability: vp8_capability(),
                payload_type: VP8_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)?;

        let mut setting_engine = SettingEngine::default();
        if let Some(public_ip) = config.public_ip {
            tracing::info!("Advertising {} as host candidate address", public_ip);
            setting_engine.set_nat_1to1_ips(vec![public_ip.to_string()], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let mut ice_servers = vec![];

        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_session(&self, session_id: Uuid) -> Result<MediaSessionParts> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        let track = Arc::new(TrackLocalStaticRTP::new(
            vp8_capability(),
            "video".to_string(),
            format!("deskcast-{}", session_id),
        ));

        let rtp_sender = match peer_connection.add_track(track.clone()).await {
            Ok(sender) => sender,
            Err(e) => {
                if let Err(close_err) = peer_connection.close().await {
                    tracing::warn!("Error closing peer connection: {}", close_err);
                }
                return Err(e.into());
            }
        };

        // Interceptors only run while someone reads RTCP from the sender
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();

            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };

                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(MediaEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let state_tx = events_tx;
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let _ = state_tx.send(MediaEvent::StateChanged(media_state(state)));
            Box::pin(async {})
        }));

        tracing::debug!("Created peer connection for session {}", session_id);

        Ok(MediaSessionParts {
            session: Arc::new(WebRtcSession { peer_connection }),
            sink: Arc::new(TrackSink { track }),
            events: events_rx,
        })
    }
}

fn media_state(state: RTCPeerConnectionState) -> MediaState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => MediaState::New,
        RTCPeerConnectionState::Connecting => MediaState::Connecting,
        RTCPeerConnectionState::Connected => MediaState::Connected,
        RTCPeerConnectionState::Disconnected => MediaState::Disconnected,
        RTCPeerConnectionState::Failed => MediaState::Failed,
        RTCPeerConnectionState::Closed => MediaState::Closed,
    }
}

struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let offer = RTCSessionDescription::offer(offer.sdp)?;
        self.peer_connection.set_remote_description(offer).await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

struct TrackSink {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl PacketSink for TrackSink {
    async fn write_packet(&self, packet: &Packet) -> Result<(), SinkError> {
        match self.track.write_rtp(packet).await {
            Ok(_) => Ok(()),
            Err(webrtc::Error::ErrClosedPipe) => Err(SinkError::Closed),
            Err(e) => Err(SinkError::Write(e)),
        }
    }
}
