//! JSON wire codec for gateway frames.
//!
//! Transports that speak text frames (WebSocket) use these helpers so the frame
//! layout stays in one place. Frames are `type`-tagged, snake_case objects:
//!
//! ```json
//! {"type": "ping", "ref": 3}
//! {"type": "subscribe", "topic": "event_capacity", "filterKey": "evt-42"}
//! {"type": "pong", "ref": 3}
//! {"type": "change", "topic": "event_capacity", "filterKey": "evt-42", "operation": "update", "row": {...}, "serverTimestamp": "..."}
//! ```

use crate::gateway::{ClientFrame, ServerFrame};
use thiserror::Error;

/// Wire encoding errors.
#[derive(Error, Debug)]
pub enum WireError {
    /// The text is not valid JSON or does not match any frame layout
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a client frame as JSON text.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] if serialization fails.
pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, WireError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a client frame (used by gateway test doubles).
///
/// # Errors
///
/// Returns [`WireError::Malformed`] for unknown or malformed frames.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a server frame as JSON text (used by gateway test doubles).
///
/// # Errors
///
/// Returns [`WireError::Malformed`] if serialization fails.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, WireError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a server frame from JSON text.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] for unknown or malformed frames.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, WireError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::change::ChangeOperation;
    use crate::topic::{FilterKey, Topic};

    #[test]
    fn ping_uses_ref_field() {
        let text = encode_client_frame(&ClientFrame::Ping { reference: 3 }).unwrap();
        assert_eq!(text, r#"{"type":"ping","ref":3}"#);
    }

    #[test]
    fn subscribe_frame_layout() {
        let frame = ClientFrame::Subscribe {
            topic: Topic::UserNotifications,
            filter_key: FilterKey::new("user-1"),
        };
        let text = encode_client_frame(&frame).unwrap();
        assert_eq!(
            text,
            r#"{"type":"subscribe","topic":"user_notifications","filterKey":"user-1"}"#
        );
        assert_eq!(decode_client_frame(&text).unwrap(), frame);
    }

    #[test]
    fn change_frame_is_flattened() {
        let text = r#"{
            "type": "change",
            "topic": "event_capacity",
            "filterKey": "evt-42",
            "operation": "update",
            "row": {"capacity": 500, "sold_tickets": 12, "updated_at": "2025-01-01T00:00:10Z"},
            "serverTimestamp": "2025-01-01T00:00:10Z"
        }"#;

        match decode_server_frame(text).unwrap() {
            ServerFrame::Change(envelope) => {
                assert_eq!(envelope.topic, Topic::EventCapacity);
                assert_eq!(envelope.filter_key.as_str(), "evt-42");
                assert_eq!(envelope.operation, ChangeOperation::Update);
            },
            other => panic!("expected change frame, got {other:?}"),
        }
    }

    #[test]
    fn connection_established_matches_gateway_greeting() {
        let frame =
            decode_server_frame(r#"{"type":"connection_established","connection_id":"c-1"}"#)
                .unwrap();
        assert!(matches!(frame, ServerFrame::ConnectionEstablished { .. }));
    }

    #[test]
    fn unknown_frame_type_is_malformed() {
        assert!(decode_server_frame(r#"{"type":"room_message"}"#).is_err());
    }
}
