use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{IceCandidate, SdpType, SessionDescription};

/// Raw `{"type": ..., "data": ...}` frame as it travels over the websocket.
///
/// Decoding is done in two steps: first the envelope, then the payload
/// against the schema selected by `type`. This keeps an unknown tag apart
/// from a known tag with a broken payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Message tags the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "ice-candidate" => Some(MessageKind::IceCandidate),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Expected {kind} description, got {found}")]
    UnexpectedSdpType { kind: MessageKind, found: SdpType },

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    /// Tag of the message whose payload failed, if the envelope itself was readable
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            ProtocolError::InvalidPayload { kind, .. }
            | ProtocolError::UnexpectedSdpType { kind, .. } => Some(*kind),
            ProtocolError::InvalidEnvelope(_) | ProtocolError::Encode(_) => None,
        }
    }
}

/// Signaling messages exchanged in both directions between a viewer and the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Session description proposed by the viewer
    Offer(SessionDescription),

    /// Session description produced in response to an offer
    Answer(SessionDescription),

    /// Connectivity candidate discovered by either side
    IceCandidate(IceCandidate),

    /// Any tag not listed above; carries the tag for logging
    Unknown(String),
}

impl SignalingMessage {
    /// Decode a text frame into a typed message
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(ProtocolError::InvalidEnvelope)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Some(kind) = MessageKind::from_tag(&envelope.kind) else {
            return Ok(SignalingMessage::Unknown(envelope.kind));
        };

        match kind {
            MessageKind::Offer => {
                let description = description_payload(kind, envelope.data, SdpType::Offer)?;
                Ok(SignalingMessage::Offer(description))
            }
            MessageKind::Answer => {
                let description = description_payload(kind, envelope.data, SdpType::Answer)?;
                Ok(SignalingMessage::Answer(description))
            }
            MessageKind::IceCandidate => {
                let candidate = serde_json::from_value(envelope.data)
                    .map_err(|source| ProtocolError::InvalidPayload { kind, source })?;
                Ok(SignalingMessage::IceCandidate(candidate))
            }
        }
    }

    /// Encode into the envelope text sent over the websocket
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            SignalingMessage::Offer(description) | SignalingMessage::Answer(description) => {
                Envelope {
                    kind: self.tag().to_string(),
                    data: serde_json::to_value(description).map_err(ProtocolError::Encode)?,
                }
            }
            SignalingMessage::IceCandidate(candidate) => Envelope {
                kind: self.tag().to_string(),
                data: serde_json::to_value(candidate).map_err(ProtocolError::Encode)?,
            },
            SignalingMessage::Unknown(tag) => Envelope {
                kind: tag.clone(),
                data: Value::Null,
            },
        };

        serde_json::to_string(&envelope).map_err(ProtocolError::Encode)
    }

    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            SignalingMessage::Offer(_) => Some(MessageKind::Offer),
            SignalingMessage::Answer(_) => Some(MessageKind::Answer),
            SignalingMessage::IceCandidate(_) => Some(MessageKind::IceCandidate),
            SignalingMessage::Unknown(_) => None,
        }
    }

    /// Wire tag of this message
    pub fn tag(&self) -> &str {
        match self {
            SignalingMessage::Unknown(tag) => tag,
            other => other.kind().map(|k| k.as_str()).unwrap_or_default(),
        }
    }
}

fn description_payload(
    kind: MessageKind,
    data: Value,
    expected: SdpType,
) -> Result<SessionDescription, ProtocolError> {
    let description: SessionDescription = serde_json::from_value(data)
        .map_err(|source| ProtocolError::InvalidPayload { kind, source })?;

    if description.sdp_type != expected {
        return Err(ProtocolError::UnexpectedSdpType {
            kind,
            found: description.sdp_type,
        });
    }

    Ok(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_offer() {
        let text = r#"{"type":"offer","data":{"type":"offer","sdp":"v=0\r\n"}}"#;
        let msg = SignalingMessage::decode(text).unwrap();
        assert_eq!(msg, SignalingMessage::Offer(SessionDescription::offer("v=0\r\n")));
    }

    #[test]
    fn test_decode_empty_candidate_with_nulls() {
        let text = r#"{"type":"ice-candidate","data":{"candidate":"","sdpMid":null,"sdpMLineIndex":null}}"#;
        match SignalingMessage::decode(text).unwrap() {
            SignalingMessage::IceCandidate(candidate) => {
                assert_eq!(candidate.candidate, "");
                assert!(candidate.sdp_mid.is_none());
                assert!(candidate.sdp_mline_index.is_none());
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("Expected IceCandidate, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let msg = SignalingMessage::decode(r#"{"type":"bitrate","data":{"kbps":900}}"#).unwrap();
        assert_eq!(msg, SignalingMessage::Unknown("bitrate".to_string()));
        assert!(msg.kind().is_none());
    }

    #[test]
    fn test_malformed_offer_payload_reports_kind() {
        let err = SignalingMessage::decode(r#"{"type":"offer","data":{"sdp":42}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
        assert_eq!(err.kind(), Some(MessageKind::Offer));
    }

    #[test]
    fn test_offer_with_answer_description_is_rejected() {
        let err =
            SignalingMessage::decode(r#"{"type":"offer","data":{"type":"answer","sdp":""}}"#)
                .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedSdpType {
                kind: MessageKind::Offer,
                found: SdpType::Answer
            }
        ));
    }

    #[test]
    fn test_invalid_envelope() {
        let err = SignalingMessage::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEnvelope(_)));
        assert!(err.kind().is_none());

        let err = SignalingMessage::decode(r#"{"data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_encode_answer_shape() {
        let text = SignalingMessage::Answer(SessionDescription::answer("v=0"))
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "answer", "data": {"type": "answer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_encode_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let text = SignalingMessage::IceCandidate(candidate).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["data"]["sdpMid"], "0");
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
        assert!(value["data"].get("usernameFragment").is_none());
    }
}
