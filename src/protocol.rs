#![forbid(unsafe_code)]

//! Request/response envelopes for the persistent connection.
//!
//! Every frame is a JSON object with an `action` field. Inbound envelopes are
//! validated field by field; a missing or mis-typed field short-circuits into
//! an error envelope before any handler runs. Unknown actions are ignored
//! entirely so older servers keep working against newer clients.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Value, json};

/// Protocol version spoken over the wire, independent of the crate version.
pub const API_VERSION: &str = "0.0.0-poc.1.0.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Handshake,
    RequestMedia,
    GetChunk,
    GetVid,
}

impl Action {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "handshake" => Some(Self::Handshake),
            "request_media" => Some(Self::RequestMedia),
            "get_chunk" => Some(Self::GetChunk),
            "get_vid" => Some(Self::GetVid),
            _ => None,
        }
    }
}

/// Successful `request_media` payload. `playlist_videos` disappears from the
/// serialized form when empty; clients key on its presence.
#[derive(Debug, Clone, Serialize)]
pub struct MediaResponse {
    pub action: &'static str,
    pub id: String,
    pub title: Option<String>,
    pub like_count: Option<i64>,
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub playlist_videos: Vec<String>,
}

pub fn error_envelope(message: &str) -> Value {
    json!({ "action": "error", "message": message })
}

pub fn status_envelope(message: &str) -> Value {
    json!({ "action": "status", "message": message })
}

pub fn chunk_envelope(bytes: &[u8]) -> Value {
    json!({ "action": "chunk", "chunk": BASE64.encode(bytes) })
}

pub fn vid_envelope(lines: &[String]) -> Value {
    json!({ "action": "vid", "lines": lines })
}

pub fn handshake_envelope(server_version: &str) -> Value {
    json!({
        "action": "handshake",
        "server": { "version": server_version },
        "api": { "version": API_VERSION },
        "capabilities": {
            "video": ["32vid"],
            "audio": ["dfpwm"],
        },
    })
}

/// Extracts a required string field, or the error envelope to send back.
pub fn require_str<'a>(message: &'a Value, field: &str) -> Result<&'a str, Value> {
    message
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| type_error(field, "string"))
}

/// Extracts a required integer field, or the error envelope to send back.
pub fn require_int(message: &Value, field: &str) -> Result<i64, Value> {
    message
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| type_error(field, "integer"))
}

/// Extracts an optional integer field; present-but-mis-typed is still an
/// error (`request_media` accepts absent dimensions, not garbage ones).
pub fn optional_int(message: &Value, field: &str) -> Result<Option<i64>, Value> {
    match message.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| type_error(field, "integer")),
    }
}

fn type_error(field: &str, type_name: &str) -> Value {
    error_envelope(&format!("{field} must be a {type_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_actions_parse_and_unknown_do_not() {
        assert_eq!(Action::parse("handshake"), Some(Action::Handshake));
        assert_eq!(Action::parse("request_media"), Some(Action::RequestMedia));
        assert_eq!(Action::parse("get_chunk"), Some(Action::GetChunk));
        assert_eq!(Action::parse("get_vid"), Some(Action::GetVid));
        assert_eq!(Action::parse("reboot"), None);
        assert_eq!(Action::parse(""), None);
    }

    #[test]
    fn missing_field_yields_typed_error() {
        let message = json!({ "action": "get_vid" });
        let err = require_int(&message, "height").unwrap_err();
        assert_eq!(err["action"], "error");
        assert_eq!(err["message"], "height must be a integer");
    }

    #[test]
    fn mistyped_field_yields_typed_error() {
        let message = json!({ "action": "request_media", "url": 42 });
        let err = require_str(&message, "url").unwrap_err();
        assert_eq!(err["message"], "url must be a string");
    }

    #[test]
    fn optional_int_accepts_absent_but_not_garbage() {
        let message = json!({ "action": "request_media", "url": "u", "width": "wide" });
        assert_eq!(optional_int(&message, "height").unwrap(), None);
        let err = optional_int(&message, "width").unwrap_err();
        assert_eq!(err["message"], "width must be a integer");

        let message = json!({ "width": 120 });
        assert_eq!(optional_int(&message, "width").unwrap(), Some(120));
    }

    #[test]
    fn media_response_omits_empty_playlist() {
        let response = MediaResponse {
            action: "media",
            id: "abc".into(),
            title: Some("A title".into()),
            like_count: Some(3),
            view_count: None,
            playlist_videos: Vec::new(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["action"], "media");
        assert_eq!(value["view_count"], Value::Null);
        assert!(value.get("playlist_videos").is_none());

        let response = MediaResponse {
            playlist_videos: vec!["next-id".into()],
            ..response
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["playlist_videos"][0], "next-id");
    }

    #[test]
    fn chunk_envelope_is_base64() {
        let value = chunk_envelope(b"\x00\x01\xfe");
        assert_eq!(value["action"], "chunk");
        assert_eq!(value["chunk"], BASE64.encode(b"\x00\x01\xfe"));
    }

    #[test]
    fn handshake_lists_capabilities() {
        let value = handshake_envelope("1.2.3");
        assert_eq!(value["server"]["version"], "1.2.3");
        assert_eq!(value["api"]["version"], API_VERSION);
        assert_eq!(value["capabilities"]["video"][0], "32vid");
        assert_eq!(value["capabilities"]["audio"][0], "dfpwm");
    }
}
