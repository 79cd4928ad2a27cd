//! Viewer session state machine
//!
//! `Connected -> Negotiating -> Active -> Closed`. One task per viewer reads
//! inbound signaling; a second task relays engine events (local candidates,
//! connection state) outward and deregisters the sink the moment the engine
//! reports a terminal state. Both hang off the session's cancellation token
//! and are joined on teardown.

use crate::error::{Result, SessionError};
use crate::media::{MediaEvent, MediaSession, PacketSink};
use crate::relay::{SinkId, SinkRegistry};
use deskcast_protocol::{IceCandidate, MessageKind, SessionDescription, SignalingMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel open, no media session yet
    Connected,
    /// Media session created, sink not registered
    Negotiating,
    /// Sink registered, packets flow
    Active,
    /// Sink deregistered, media session released
    Closed,
}

/// Why the inbound loop stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Viewer closed the channel or the transport ended
    Disconnected,
    /// Media engine reported failure, or the process is shutting down
    Cancelled,
}

pub struct ViewerSession {
    id: SinkId,
    state: SessionState,
    media: Arc<dyn MediaSession>,
    sink: Arc<dyn PacketSink>,
    registry: Arc<SinkRegistry>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    cancel: CancellationToken,
    negotiation_timeout: Option<Duration>,
    negotiation_deadline: Option<Instant>,
}

impl ViewerSession {
    pub fn new(
        id: SinkId,
        media: Arc<dyn MediaSession>,
        sink: Arc<dyn PacketSink>,
        registry: Arc<SinkRegistry>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        cancel: CancellationToken,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Negotiating,
            media,
            sink,
            registry,
            outbound,
            cancel,
            negotiation_timeout,
            negotiation_deadline: negotiation_timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Pump inbound text frames until the channel ends, the session is
    /// cancelled, or a session-scoped error occurs.
    pub async fn run<S>(&mut self, inbound: &mut S) -> Result<CloseReason>
    where
        S: futures_util::Stream<Item = std::result::Result<String, SessionError>> + Unpin,
    {
        use futures_util::StreamExt;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(CloseReason::Cancelled),

                _ = negotiation_timer(self.negotiation_deadline),
                    if self.state == SessionState::Negotiating =>
                {
                    let waited = self.negotiation_timeout.unwrap_or_default();
                    return Err(SessionError::NegotiationTimeout(waited));
                }

                frame = inbound.next() => match frame {
                    Some(Ok(text)) => self.handle_text(&text).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(CloseReason::Disconnected),
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<()> {
        let message = match SignalingMessage::decode(text) {
            Ok(message) => message,
            // A broken offer ends the session, anything else is dropped
            Err(e) if e.kind() == Some(MessageKind::Offer) => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Ignoring signaling message: {}", e);
                return Ok(());
            }
        };

        match message {
            SignalingMessage::Offer(offer) => self.handle_offer(offer).await,
            SignalingMessage::IceCandidate(candidate) => {
                self.handle_remote_candidate(candidate).await;
                Ok(())
            }
            SignalingMessage::Answer(_) => {
                tracing::warn!("Ignoring answer from viewer, the relay always answers");
                Ok(())
            }
            SignalingMessage::Unknown(tag) => {
                tracing::info!("Ignoring unknown message type {:?}", tag);
                Ok(())
            }
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<()> {
        let m_line_count = offer.sdp.lines().filter(|l| l.starts_with("m=")).count();
        tracing::info!(
            "Received offer with {} m-lines in state {:?}",
            m_line_count,
            self.state
        );

        let answer = self
            .media
            .accept_offer(offer)
            .await
            .map_err(SessionError::Negotiation)?;

        if self.state == SessionState::Negotiating {
            self.registry.insert(self.id, &self.sink).await;

            // The engine may have failed while we negotiated; its event task
            // cancels before deregistering, so checking here closes the gap
            if self.cancel.is_cancelled() {
                self.registry.remove(self.id).await;
                return Ok(());
            }

            self.state = SessionState::Active;
            tracing::info!("Viewer active, sink registered");
        }

        self.send(SignalingMessage::Answer(answer));
        Ok(())
    }

    async fn handle_remote_candidate(&self, candidate: IceCandidate) {
        tracing::debug!("Received ICE candidate {:?}", candidate.candidate);

        if let Err(e) = self.media.add_remote_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate: {}", e);
        }
    }

    fn send(&self, message: SignalingMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("Outbound channel closed, dropping message");
        }
    }

    /// Deregister the sink and release the media session.
    ///
    /// Safe to reach from every exit path; deregistration is idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        self.cancel.cancel();

        if self.registry.remove(self.id).await {
            tracing::info!("Sink deregistered");
        }

        if let Err(e) = self.media.close().await {
            tracing::warn!("Error closing media session: {}", e);
        }

        self.state = SessionState::Closed;
    }
}

async fn negotiation_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Relay engine events for one session until it is cancelled.
///
/// Local candidates go straight to the outbound queue, never waiting on
/// inbound handling. A terminal connection state cancels the session and
/// deregisters its sink right away.
pub async fn relay_media_events(
    id: SinkId,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    registry: Arc<SinkRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(MediaEvent::LocalCandidate(candidate)) => {
                if outbound.send(SignalingMessage::IceCandidate(candidate)).is_err() {
                    break;
                }
            }
            Some(MediaEvent::StateChanged(state)) => {
                tracing::info!("Media connection state: {:?}", state);

                if state.is_terminal() {
                    cancel.cancel();
                    if registry.remove(id).await {
                        tracing::info!("Sink deregistered after media {:?}", state);
                    }
                    break;
                }
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::media::{MediaState, Packet};
    use async_trait::async_trait;
    use deskcast_protocol::SdpType;
    use futures_util::{stream, StreamExt};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct ScriptedMedia {
        candidates: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl MediaSession for ScriptedMedia {
        async fn accept_offer(
            &self,
            offer: SessionDescription,
        ) -> anyhow::Result<SessionDescription> {
            if offer.sdp.starts_with("v=0") {
                Ok(SessionDescription::answer("v=0 answer"))
            } else {
                anyhow::bail!("unparseable sdp")
            }
        }

        async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
            self.candidates.fetch_add(1, Ordering::SeqCst);
            if candidate.candidate.is_empty() {
                anyhow::bail!("no remote description")
            }
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullSink;

    #[async_trait]
    impl PacketSink for NullSink {
        async fn write_packet(&self, _packet: &Packet) -> std::result::Result<(), SinkError> {
            Ok(())
        }
    }

    struct Harness {
        session: ViewerSession,
        media: Arc<ScriptedMedia>,
        registry: Arc<SinkRegistry>,
        outbound: mpsc::UnboundedReceiver<SignalingMessage>,
        cancel: CancellationToken,
        id: SinkId,
    }

    fn harness(negotiation_timeout: Option<Duration>) -> Harness {
        let media = Arc::new(ScriptedMedia::default());
        let registry = Arc::new(SinkRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();
        let session = ViewerSession::new(
            id,
            media.clone(),
            Arc::new(NullSink),
            registry.clone(),
            tx,
            cancel.clone(),
            negotiation_timeout,
        );
        Harness {
            session,
            media,
            registry,
            outbound: rx,
            cancel,
            id,
        }
    }

    fn frames(texts: &[&str]) -> impl futures_util::Stream<Item = Result<String>> + Unpin {
        let owned: Vec<Result<String>> = texts.iter().map(|t| Ok(t.to_string())).collect();
        stream::iter(owned)
    }

    const OFFER: &str = r#"{"type":"offer","data":{"type":"offer","sdp":"v=0 offer"}}"#;

    #[tokio::test]
    async fn test_offer_registers_sink_and_answers() {
        let mut h = harness(None);

        let reason = h.session.run(&mut frames(&[OFFER])).await.unwrap();

        assert_eq!(reason, CloseReason::Disconnected);
        assert_eq!(h.session.state(), SessionState::Active);
        assert!(h.registry.contains(h.id).await);
        match h.outbound.try_recv().unwrap() {
            SignalingMessage::Answer(answer) => {
                assert_eq!(answer.sdp_type, SdpType::Answer);
                assert_eq!(answer.sdp, "v=0 answer");
            }
            other => panic!("Expected answer, got {:?}", other),
        }

        h.session.close().await;
        assert!(h.registry.is_empty().await);
        assert!(h.media.closed.load(Ordering::SeqCst));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_renegotiation_keeps_single_registration() {
        let mut h = harness(None);

        h.session.run(&mut frames(&[OFFER, OFFER])).await.unwrap();

        assert_eq!(h.registry.len().await, 1);
        assert!(matches!(h.outbound.try_recv(), Ok(SignalingMessage::Answer(_))));
        assert!(matches!(h.outbound.try_recv(), Ok(SignalingMessage::Answer(_))));
    }

    #[tokio::test]
    async fn test_malformed_offer_ends_session_unregistered() {
        let mut h = harness(None);

        let result = h
            .session
            .run(&mut frames(&[r#"{"type":"offer","data":{"sdp":1}}"#, OFFER]))
            .await;

        assert!(matches!(result, Err(SessionError::Protocol(_))));
        assert!(!h.registry.contains(h.id).await);
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_offer_ends_session_unregistered() {
        let mut h = harness(None);
        let bad_sdp = r#"{"type":"offer","data":{"type":"offer","sdp":"garbage"}}"#;

        let result = h.session.run(&mut frames(&[bad_sdp])).await;

        assert!(matches!(result, Err(SessionError::Negotiation(_))));
        assert!(h.registry.is_empty().await);
        assert_eq!(h.session.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_candidates_unknown_and_junk_are_not_fatal() {
        let mut h = harness(None);

        let reason = h
            .session
            .run(&mut frames(&[
                r#"{"type":"ice-candidate","data":{"candidate":"","sdpMid":null,"sdpMLineIndex":null}}"#,
                r#"{"type":"ice-candidate","data":{"candidate":7}}"#,
                r#"{"type":"answer","data":{"type":"answer","sdp":"v=0"}}"#,
                r#"{"type":"stats","data":{}}"#,
                "not json at all",
                OFFER,
            ]))
            .await
            .unwrap();

        assert_eq!(reason, CloseReason::Disconnected);
        assert_eq!(h.media.candidates.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_transport_error_ends_session() {
        let mut h = harness(None);
        let mut inbound = stream::iter(vec![
            Ok(OFFER.to_string()),
            Err(SessionError::Transport(axum::Error::new(std::io::Error::other(
                "connection reset",
            )))),
        ]);

        assert!(h.session.run(&mut inbound).await.is_err());
        assert!(h.registry.contains(h.id).await);

        h.session.close().await;
        h.session.close().await;
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let mut h = harness(None);
        h.cancel.cancel();

        let reason = h.session.run(&mut stream::pending()).await.unwrap();
        assert_eq!(reason, CloseReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_reaps_idle_session() {
        let mut h = harness(Some(Duration::from_secs(30)));

        let result = h.session.run(&mut stream::pending()).await;

        assert!(matches!(result, Err(SessionError::NegotiationTimeout(_))));
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_ignored_once_active() {
        let mut h = harness(Some(Duration::from_secs(30)));
        let inbound = stream::iter(vec![Ok(OFFER.to_string())]).chain(stream::pending());
        let mut inbound = Box::pin(inbound);

        let run = tokio::time::timeout(Duration::from_secs(120), h.session.run(&mut inbound)).await;

        // Still running after the negotiation deadline passed
        assert!(run.is_err());
        assert!(h.registry.contains(h.id).await);
    }

    #[tokio::test]
    async fn test_terminal_media_state_deregisters_and_cancels() {
        let mut h = harness(None);
        h.session.run(&mut frames(&[OFFER])).await.unwrap();
        assert!(h.registry.contains(h.id).await);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_media_events(
            h.id,
            events_rx,
            out_tx,
            h.registry.clone(),
            h.cancel.clone(),
        ));

        events_tx
            .send(MediaEvent::LocalCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 4000 typ host".to_string(),
                ..Default::default()
            }))
            .unwrap();
        events_tx
            .send(MediaEvent::StateChanged(MediaState::Connected))
            .unwrap();
        events_tx
            .send(MediaEvent::StateChanged(MediaState::Failed))
            .unwrap();

        relay.await.unwrap();

        assert!(h.cancel.is_cancelled());
        assert!(!h.registry.contains(h.id).await);
        assert!(matches!(
            out_rx.try_recv(),
            Ok(SignalingMessage::IceCandidate(_))
        ));
    }
}
