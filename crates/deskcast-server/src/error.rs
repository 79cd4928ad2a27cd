use deskcast_protocol::ProtocolError;
use thiserror::Error;

/// Failures scoped to a single viewer session.
///
/// Any of these ends the session it occurred in and nothing else.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to create media session: {0}")]
    Create(#[source] anyhow::Error),

    #[error("Negotiation rejected: {0}")]
    Negotiation(#[source] anyhow::Error),

    #[error("Invalid signaling message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Signaling transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("Session stuck in negotiation for {0:?}")]
    NegotiationTimeout(std::time::Duration),
}

/// Failure delivering one packet to one sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Write failed: {0}")]
    Write(#[from] webrtc::Error),

    #[error("Write did not finish within {0:?}")]
    Timeout(std::time::Duration),
}

/// Datagram on the ingest socket that is not a usable RTP packet
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Datagram too short for an RTP header ({0} bytes)")]
    TooShort(usize),

    #[error("Unsupported RTP version {0}")]
    Version(u8),

    #[error("Malformed RTP packet: {0}")]
    Malformed(#[from] webrtc::util::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
