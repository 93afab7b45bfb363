use serde::Deserialize;
use serde_json::Value;

use super::error::{HolodexError, Result};
use super::types::ChatPayload;

// Engine.IO / Socket.IO type prefixes as they appear on the wire.
pub const FRAME_HANDSHAKE_PREFIX: &str = "0";
pub const FRAME_PING: &str = "2";
pub const FRAME_PONG: &str = "3";
pub const FRAME_CONNECT: &str = "40";
pub const FRAME_DISCONNECT: &str = "41";
pub const FRAME_EVENT_PREFIX: &str = "42";

pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";
const EVENT_SUBSCRIBE_SUCCESS: &str = "subscribeSuccess";
const EVENT_SUBSCRIBE_ERROR: &str = "subscribeError";

#[derive(Debug, Deserialize)]
struct HandshakePayload {
    sid: String,
}

/// One inbound frame, classified by its type prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake { sid: String },
    Ping,
    Pong,
    ConnectAck,
    Disconnect,
    Event { name: String, payload: Value },
    Other(String),
}

impl Frame {
    /// Parses a raw text frame. Malformed handshake or event JSON is a
    /// protocol error; unrecognized but well-formed frames come back as
    /// `Other` so the caller can log and move on.
    pub fn parse(raw: &str) -> Result<Frame> {
        if raw == FRAME_PING {
            return Ok(Frame::Ping);
        }
        if raw == FRAME_PONG {
            return Ok(Frame::Pong);
        }
        if let Some(body) = raw.strip_prefix(FRAME_EVENT_PREFIX) {
            return Self::parse_event(body);
        }
        if raw.starts_with(FRAME_DISCONNECT) {
            return Ok(Frame::Disconnect);
        }
        if raw.starts_with(FRAME_CONNECT) {
            return Ok(Frame::ConnectAck);
        }
        if let Some(body) = raw.strip_prefix(FRAME_HANDSHAKE_PREFIX) {
            let handshake: HandshakePayload = serde_json::from_str(body).map_err(|e| {
                HolodexError::Protocol(format!("invalid handshake payload: {}", e))
            })?;
            return Ok(Frame::Handshake { sid: handshake.sid });
        }
        Ok(Frame::Other(raw.to_string()))
    }

    fn parse_event(body: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| HolodexError::Protocol(format!("invalid event frame: {}", e)))?;
        let Value::Array(mut items) = value else {
            return Err(HolodexError::Protocol(
                "event frame is not a two-element array".to_string(),
            ));
        };
        if items.len() < 2 {
            return Err(HolodexError::Protocol(
                "event frame is not a two-element array".to_string(),
            ));
        }
        let payload = items.remove(1);
        let Value::String(name) = items.remove(0) else {
            return Err(HolodexError::Protocol(
                "event name is not a string".to_string(),
            ));
        };
        Ok(Frame::Event { name, payload })
    }
}

/// A decoded application event from the realtime feed.
#[derive(Debug)]
pub enum FeedEvent {
    SubscribeSuccess {
        video_id: Option<String>,
    },
    SubscribeError {
        video_id: Option<String>,
        message: Option<String>,
    },
    Chat {
        video_id: String,
        payload: ChatPayload,
    },
    /// The remote side closed the chat for this stream; only local
    /// bookkeeping remains, no unsubscribe frame should be sent.
    ChatEnded {
        video_id: String,
    },
    Ignored,
}

/// Classifies an event frame. Chat event names are formed as
/// `"{video_id}/{lang}"`; only the configured language is accepted.
pub fn classify_event(name: &str, payload: Value, chat_lang: &str) -> FeedEvent {
    if name == EVENT_SUBSCRIBE_SUCCESS {
        return FeedEvent::SubscribeSuccess {
            video_id: payload_id(&payload),
        };
    }
    if name == EVENT_SUBSCRIBE_ERROR {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        return FeedEvent::SubscribeError {
            video_id: payload_id(&payload),
            message,
        };
    }

    let lang_suffix = format!("/{}", chat_lang);
    if let Some(video_id) = name.strip_suffix(&lang_suffix) {
        if video_id.is_empty() || video_id.contains('/') {
            return FeedEvent::Ignored;
        }
        let chat: ChatPayload = match serde_json::from_value(payload) {
            Ok(chat) => chat,
            Err(e) => {
                tracing::debug!(event = %name, error = %e, "Unparseable chat payload ignored");
                return FeedEvent::Ignored;
            }
        };
        if chat.is_end_marker() {
            return FeedEvent::ChatEnded {
                video_id: video_id.to_string(),
            };
        }
        if chat.name.as_deref().is_some_and(|name| !name.is_empty()) {
            return FeedEvent::Chat {
                video_id: video_id.to_string(),
                payload: chat,
            };
        }
    }
    FeedEvent::Ignored
}

fn payload_id(payload: &Value) -> Option<String> {
    payload.get("id").and_then(Value::as_str).map(str::to_string)
}

pub fn encode_subscribe(video_id: &str, lang: &str) -> String {
    encode_event(EVENT_SUBSCRIBE, video_id, lang)
}

pub fn encode_unsubscribe(video_id: &str, lang: &str) -> String {
    encode_event(EVENT_UNSUBSCRIBE, video_id, lang)
}

fn encode_event(event: &str, video_id: &str, lang: &str) -> String {
    format!(
        "{}{}",
        FRAME_EVENT_PREFIX,
        serde_json::json!([event, { "video_id": video_id, "lang": lang }])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake_extracts_sid() {
        let frame = Frame::parse(r#"0{"sid":"abc123","pingInterval":25000}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Handshake {
                sid: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_parse_handshake_without_sid_is_protocol_error() {
        let result = Frame::parse(r#"0{"pingInterval":25000}"#);
        assert!(matches!(result, Err(HolodexError::Protocol(_))));
    }

    #[test]
    fn test_parse_protocol_frames() {
        assert_eq!(Frame::parse("2").unwrap(), Frame::Ping);
        assert_eq!(Frame::parse("3").unwrap(), Frame::Pong);
        assert_eq!(Frame::parse("40").unwrap(), Frame::ConnectAck);
        assert_eq!(Frame::parse("41").unwrap(), Frame::Disconnect);
    }

    #[test]
    fn test_parse_event_frame() {
        let frame = Frame::parse(r#"42["subscribeSuccess",{"id":"vid001"}]"#).unwrap();
        match frame {
            Frame::Event { name, payload } => {
                assert_eq!(name, "subscribeSuccess");
                assert_eq!(payload["id"], "vid001");
            }
            other => panic!("expected event frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_event_is_protocol_error() {
        assert!(matches!(
            Frame::parse("42{not json"),
            Err(HolodexError::Protocol(_))
        ));
        assert!(matches!(
            Frame::parse(r#"42["onlyOneElement"]"#),
            Err(HolodexError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_frame_is_other() {
        assert_eq!(
            Frame::parse("6").unwrap(),
            Frame::Other("6".to_string())
        );
    }

    #[test]
    fn test_classify_chat_event() {
        let payload = serde_json::json!({
            "name": "Translator",
            "message": "[EN] hello there",
            "is_tl": true,
            "timestamp": 1714567890000i64
        });
        match classify_event("vid001/en", payload, "en") {
            FeedEvent::Chat { video_id, payload } => {
                assert_eq!(video_id, "vid001");
                assert_eq!(payload.name.as_deref(), Some("Translator"));
                assert!(payload.is_tl);
            }
            other => panic!("expected chat event, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_chat_wrong_language_ignored() {
        let payload = serde_json::json!({"name": "Someone", "message": "hola"});
        assert!(matches!(
            classify_event("vid001/es", payload, "en"),
            FeedEvent::Ignored
        ));
    }

    #[test]
    fn test_classify_end_marker() {
        let payload = serde_json::json!({"type": "end"});
        match classify_event("vid001/en", payload, "en") {
            FeedEvent::ChatEnded { video_id } => assert_eq!(video_id, "vid001"),
            other => panic!("expected end-of-chat, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_subscribe_results() {
        let ok = serde_json::json!({"id": "vid001"});
        assert!(matches!(
            classify_event("subscribeSuccess", ok, "en"),
            FeedEvent::SubscribeSuccess { video_id: Some(id) } if id == "vid001"
        ));

        let err = serde_json::json!({"id": "vid001", "message": "not live"});
        match classify_event("subscribeError", err, "en") {
            FeedEvent::SubscribeError { video_id, message } => {
                assert_eq!(video_id.as_deref(), Some("vid001"));
                assert_eq!(message.as_deref(), Some("not live"));
            }
            other => panic!("expected subscribe error, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_nameless_payload_ignored() {
        let payload = serde_json::json!({"message": "status only"});
        assert!(matches!(
            classify_event("vid001/en", payload, "en"),
            FeedEvent::Ignored
        ));
    }

    #[test]
    fn test_encode_subscribe_round_trips() {
        let raw = encode_subscribe("vid001", "en");
        let frame = Frame::parse(&raw).unwrap();
        match frame {
            Frame::Event { name, payload } => {
                assert_eq!(name, EVENT_SUBSCRIBE);
                assert_eq!(payload["video_id"], "vid001");
                assert_eq!(payload["lang"], "en");
            }
            other => panic!("expected event frame, got {:?}", other),
        }

        let raw = encode_unsubscribe("vid002", "en");
        assert!(raw.starts_with(FRAME_EVENT_PREFIX));
        assert!(raw.contains("unsubscribe"));
    }
}
