//! Chat application envelope: JSON messages on top of the transport.
//!
//! Every application message is one JSON object tagged by `type`; the
//! `sender` and `recipient` labels are the virtual IPs of the endpoints
//! (`null` sender marks a server-originated system message), and
//! `timestamp` is integer seconds since the Unix epoch.  File payloads
//! travel base64-encoded inside the envelope.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Courtesy sentinel the server broadcasts before tearing connections down.
pub const SHUTDOWN_SENTINEL: &str = "__SHUTDOWN__";

/// Errors from encoding or decoding chat messages.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid chat message: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("invalid file payload: {0}")]
    BadFileData(#[from] base64::DecodeError),
}

/// One chat protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatMessage {
    /// A user-to-user text line.
    Text {
        sender: Option<String>,
        recipient: Option<String>,
        timestamp: u64,
        content: String,
    },
    /// A user-to-user file transfer; `data` is the base64 of the raw bytes.
    File {
        sender: Option<String>,
        recipient: Option<String>,
        timestamp: u64,
        name: String,
        mime: String,
        size: u64,
        data: String,
    },
    /// A server notification.
    System {
        sender: Option<String>,
        recipient: Option<String>,
        timestamp: u64,
        content: String,
    },
    /// Snapshot of the labels currently online.
    Userlist {
        sender: Option<String>,
        recipient: Option<String>,
        timestamp: u64,
        users: Vec<String>,
    },
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ChatMessage {
    pub fn text(sender: &str, recipient: &str, content: impl Into<String>) -> Self {
        Self::Text {
            sender: Some(sender.to_string()),
            recipient: Some(recipient.to_string()),
            timestamp: now(),
            content: content.into(),
        }
    }

    pub fn file(sender: &str, recipient: &str, name: &str, mime: &str, data: &[u8]) -> Self {
        Self::File {
            sender: Some(sender.to_string()),
            recipient: Some(recipient.to_string()),
            timestamp: now(),
            name: name.to_string(),
            mime: mime.to_string(),
            size: data.len() as u64,
            data: BASE64.encode(data),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            sender: None,
            recipient: None,
            timestamp: now(),
            content: content.into(),
        }
    }

    pub fn userlist(users: Vec<String>) -> Self {
        Self::Userlist {
            sender: None,
            recipient: None,
            timestamp: now(),
            users,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Text { sender, .. }
            | Self::File { sender, .. }
            | Self::System { sender, .. }
            | Self::Userlist { sender, .. } => sender.as_deref(),
        }
    }

    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Text { recipient, .. }
            | Self::File { recipient, .. }
            | Self::System { recipient, .. }
            | Self::Userlist { recipient, .. } => recipient.as_deref(),
        }
    }

    /// Decode the raw bytes of a file message.
    pub fn file_bytes(&self) -> Result<Vec<u8>, ChatError> {
        match self {
            Self::File { data, .. } => Ok(BASE64.decode(data)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Serialise to the JSON wire form.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse any protocol message from JSON bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, ChatError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn text_roundtrip() {
        let msg = ChatMessage::text("HOST_A", "HOST_B", "hi");
        let decoded = ChatMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn text_wire_shape() {
        let raw =
            br#"{"type":"text","sender":"HOST_A","recipient":"HOST_B","timestamp":0,"content":"hi"}"#;
        let msg = ChatMessage::decode(raw).unwrap();
        assert_eq!(
            msg,
            ChatMessage::Text {
                sender: Some("HOST_A".into()),
                recipient: Some("HOST_B".into()),
                timestamp: 0,
                content: "hi".into(),
            }
        );
    }

    #[test]
    fn system_has_null_sender() {
        let msg = ChatMessage::system("maintenance at noon");
        let value: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(value["type"], json!("system"));
        assert_eq!(value["sender"], Value::Null);
    }

    #[test]
    fn file_data_is_base64_and_recoverable() {
        let payload = [0u8, 1, 2, 255, 254, 253];
        let msg = ChatMessage::file("HOST_B", "HOST_A", "blob.bin", "application/octet-stream", &payload);

        let value: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(value["size"], json!(6));
        assert_eq!(value["data"], json!(BASE64.encode(payload)));

        let decoded = ChatMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.file_bytes().unwrap(), payload);
    }

    #[test]
    fn userlist_roundtrip() {
        let msg = ChatMessage::userlist(vec!["HOST_A".into(), "HOST_B".into()]);
        let decoded = ChatMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        let value: Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(value["users"], json!(["HOST_A", "HOST_B"]));
    }

    #[test]
    fn unknown_type_rejected() {
        let raw = br#"{"type":"poke","sender":null,"recipient":null,"timestamp":0}"#;
        assert!(ChatMessage::decode(raw).is_err());
    }
}
