//! Control-plane JSON frames exchanged over a websocks tunnel, plus the
//! binary data frames that carry bridged payload once a tunnel is open.
//!
//! Duplicated from the proxy crate's module of the same name rather than
//! shared through a library crate, matching the two sibling binaries'
//! independent versioning.

use axum::extract::ws::{Message, Utf8Bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    #[serde(rename = "HOST")]
    pub host: String,
    #[serde(rename = "PORT")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAck {
    #[serde(rename = "ALLOW")]
    pub allow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    #[serde(rename = "CLOSED")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseNotice {
    #[serde(rename = "STATUS")]
    pub status: CloseStatus,
}

impl OpenAck {
    pub fn allow() -> Self {
        Self { allow: true }
    }

    pub fn deny() -> Self {
        Self { allow: false }
    }

    pub fn into_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::Text(Utf8Bytes::from(serde_json::to_string(self)?)))
    }
}

impl Default for CloseNotice {
    fn default() -> Self {
        Self { status: CloseStatus::Closed }
    }
}

impl CloseNotice {
    pub fn into_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::Text(Utf8Bytes::from(serde_json::to_string(self)?)))
    }
}

/// A decoded control-channel message. Binary messages never reach this
/// type; callers branch on `Message::Binary` before attempting decode.
#[derive(Debug, Clone)]
pub enum ControlFrame {
    Open(OpenRequest),
    Close(CloseNotice),
}

impl ControlFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("HOST").is_some() {
            return Ok(ControlFrame::Open(serde_json::from_value(value)?));
        }
        if value.get("STATUS").is_some() {
            return Ok(ControlFrame::Close(serde_json::from_value(value)?));
        }
        Err(ProtocolError::UnknownFrame(text.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized control frame: {0}")]
    UnknownFrame(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Wrap a chunk of bridged payload as a binary WebSocket message.
pub fn data_message(chunk: &[u8]) -> Message {
    Message::Binary(bytes::Bytes::copy_from_slice(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_encodes_uppercase_key() {
        let msg = OpenAck::allow().into_message().unwrap();
        match msg {
            Message::Text(t) => assert_eq!(t.as_str(), r#"{"ALLOW":true}"#),
            _ => panic!("expected text message"),
        }
    }

    #[test]
    fn open_request_decodes() {
        match ControlFrame::decode(r#"{"HOST":"example.com","PORT":443}"#).unwrap() {
            ControlFrame::Open(r) => {
                assert_eq!(r.host, "example.com");
                assert_eq!(r.port, 443);
            }
            _ => panic!("expected Open frame"),
        }
    }

    #[test]
    fn close_notice_round_trips() {
        let msg = CloseNotice::default().into_message().unwrap();
        let text = match msg {
            Message::Text(t) => t,
            _ => panic!("expected text message"),
        };
        match ControlFrame::decode(&text).unwrap() {
            ControlFrame::Close(c) => assert_eq!(c.status, CloseStatus::Closed),
            _ => panic!("expected Close frame"),
        }
    }

    #[test]
    fn unknown_frame_is_rejected() {
        assert!(ControlFrame::decode(r#"{"WHAT":1}"#).is_err());
    }
}
