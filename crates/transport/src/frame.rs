use parley_storage::Turn;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{DecodeFrameSnafu, EncodeFrameSnafu, TransportResult};

/// Payload of the `error` event sent by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorPayload {
    pub message: String,
}

/// Named channel events exchanged with the peer as `{"event": .., "data": ..}` text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum Frame {
    Message(Turn),
    Error(RemoteErrorPayload),
    Ping,
    Pong,
}

impl Frame {
    pub fn remote_error(message: impl Into<String>) -> Self {
        Self::Error(RemoteErrorPayload {
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Error(_) => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> TransportResult<String> {
        serde_json::to_string(self).context(EncodeFrameSnafu {
            stage: "encode-frame",
        })
    }

    pub fn decode(raw: &str) -> TransportResult<Self> {
        serde_json::from_str(raw).context(DecodeFrameSnafu {
            stage: "decode-frame",
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use parley_storage::{Role, TurnId};

    use super::*;

    #[test]
    fn heartbeat_frames_carry_no_payload() {
        assert_eq!(Frame::Ping.encode().unwrap(), r#"{"event":"ping"}"#);
        assert_eq!(Frame::decode(r#"{"event":"pong"}"#).unwrap(), Frame::Pong);
    }

    #[test]
    fn message_frame_wraps_turn_in_data() {
        let turn = Turn::new(
            TurnId::parse("7").unwrap(),
            Role::Assistant,
            "hello",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );

        let encoded = Frame::Message(turn.clone()).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["event"], "message");
        assert_eq!(value["data"]["role"], "assistant");
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Message(turn));
    }

    #[test]
    fn error_frame_exposes_message() {
        let frame = Frame::decode(r#"{"event":"error","data":{"message":"server busy"}}"#).unwrap();

        assert_eq!(frame, Frame::remote_error("server busy"));
        assert_eq!(frame.name(), "error");
    }

    #[test]
    fn unknown_events_fail_to_decode() {
        assert!(Frame::decode(r#"{"event":"typing"}"#).is_err());
    }
}
