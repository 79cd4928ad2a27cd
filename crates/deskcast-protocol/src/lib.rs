//! Deskcast signaling protocol
//!
//! Wire types for the JSON message channel between a viewer and the relay.

pub mod messages;
pub mod types;

pub use messages::{Envelope, MessageKind, ProtocolError, SignalingMessage};
pub use types::{IceCandidate, IceServer, SdpType, SessionDescription};
