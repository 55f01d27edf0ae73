use serde::{Deserialize, Serialize};

/// Inbound message from a connected endpoint (host or viewer).
///
/// The `type` tag mirrors what clients put on the wire. WebRTC payloads are
/// opaque to the hub and forwarded untouched; anything that fails to decode
/// is dropped by the relay, not answered with an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Ready {
        data: serde_json::Value,
    },
    Offer {
        data: serde_json::Value,
    },
    Answer {
        data: serde_json::Value,
    },
    IceCandidate {
        data: serde_json::Value,
    },
    Chat {
        username: String,
        message: String,
    },
    PollStart {
        question: String,
        options: Vec<String>,
    },
    PollVote {
        poll_id: String,
        option: u32,
    },
    PollEnd {
        poll_id: String,
    },
}

/// Outbound event fanned out to a session group (or, for errors, sent back
/// to the endpoint that caused them).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEvent {
    Ready {
        data: serde_json::Value,
    },
    Offer {
        data: serde_json::Value,
    },
    Answer {
        data: serde_json::Value,
    },
    IceCandidate {
        data: serde_json::Value,
    },
    Chat {
        username: String,
        message: String,
        timestamp: String,
    },
    PollStart {
        poll_id: String,
        question: String,
        options: Vec<String>,
    },
    PollUpdate {
        poll_id: String,
        results: Vec<OptionTally>,
    },
    PollEnd {
        poll_id: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// One row of a live poll result set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionTally {
    pub text: String,
    pub votes: u64,
    pub percentage: u32,
}

/// Encode an outbound event as a JSON text frame.
pub fn encode(event: &SignalEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Decode an inbound text frame.
pub fn decode(text: &str) -> Result<SignalMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_roundtrip() {
        let raw = r#"{"type":"offer","data":{"sdp":"v=0"}}"#;
        let msg = decode(raw).expect("decode");
        assert_eq!(
            msg,
            SignalMessage::Offer {
                data: serde_json::json!({"sdp": "v=0"}),
            }
        );
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        assert!(decode(r#"{"type":"subtitle","data":{}}"#).is_err());
    }

    #[test]
    fn event_tag_is_snake_case() {
        let event = SignalEvent::PollUpdate {
            poll_id: "p1".into(),
            results: vec![OptionTally {
                text: "yes".into(),
                votes: 3,
                percentage: 75,
            }],
        };
        let text = encode(&event).expect("encode");
        assert!(text.contains(r#""type":"poll_update""#));
        assert!(text.contains(r#""percentage":75"#));
    }
}
