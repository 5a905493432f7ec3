//! Control-plane JSON frames exchanged over a websocks tunnel, plus the
//! binary data frames that carry bridged payload once a tunnel is open.
//!
//! A single WebSocket carries one logical tunnel at a time: OPEN,
//! optionally an ALLOW/DENY ack, then a stream of binary DATA frames in
//! both directions, ending with a CLOSE exchange that hands the socket
//! back to the pool for reuse.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

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

impl OpenRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn into_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

impl OpenAck {
    pub fn allow() -> Self {
        Self { allow: true }
    }

    pub fn deny() -> Self {
        Self { allow: false }
    }

    pub fn into_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

impl Default for CloseNotice {
    fn default() -> Self {
        Self { status: CloseStatus::Closed }
    }
}

impl CloseNotice {
    pub fn into_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// A decoded control-channel message. Binary messages never reach this
/// type; callers branch on `Message::Binary` before attempting decode.
#[derive(Debug, Clone)]
pub enum ControlFrame {
    Open(OpenRequest),
    Ack(OpenAck),
    Close(CloseNotice),
}

impl ControlFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("HOST").is_some() {
            return Ok(ControlFrame::Open(serde_json::from_value(value)?));
        }
        if value.get("ALLOW").is_some() {
            return Ok(ControlFrame::Ack(serde_json::from_value(value)?));
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
    #[error("tunnel denied by hub")]
    Denied,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Wrap a chunk of bridged payload as a binary WebSocket message.
pub fn data_message(chunk: &[u8]) -> Message {
    Message::Binary(chunk.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_round_trips_with_uppercase_keys() {
        let req = OpenRequest::new("example.com", 443);
        let msg = req.into_message().unwrap();
        let text = match msg {
            Message::Text(t) => t,
            _ => panic!("expected text message"),
        };
        assert!(text.contains("\"HOST\":\"example.com\""));
        assert!(text.contains("\"PORT\":443"));
        match ControlFrame::decode(&text).unwrap() {
            ControlFrame::Open(r) => {
                assert_eq!(r.host, "example.com");
                assert_eq!(r.port, 443);
            }
            _ => panic!("expected Open frame"),
        }
    }

    #[test]
    fn ack_and_close_decode() {
        match ControlFrame::decode(r#"{"ALLOW":true}"#).unwrap() {
            ControlFrame::Ack(a) => assert!(a.allow),
            _ => panic!("expected Ack"),
        }
        match ControlFrame::decode(r#"{"STATUS":"CLOSED"}"#).unwrap() {
            ControlFrame::Close(c) => assert_eq!(c.status, CloseStatus::Closed),
            _ => panic!("expected Close"),
        }
    }

    #[test]
    fn unknown_frame_is_rejected() {
        assert!(ControlFrame::decode(r#"{"WHAT":1}"#).is_err());
    }
}
