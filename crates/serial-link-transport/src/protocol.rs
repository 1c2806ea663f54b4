//! Wire protocol for client-server communication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serial_link_core::{BaudRate, PortState, SerialMessage};

/// Message from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Select and open a port.
    Connect,
    /// Close the open port.
    Disconnect,
    /// Change the baud rate used for the next open.
    SetBaudRate { baud_rate: BaudRate },
    /// Raw bytes for the port (base64 encoded).
    Send { data: String },
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Create a send message from raw bytes.
    #[must_use]
    pub fn send(data: &[u8]) -> Self {
        Self::Send {
            data: BASE64.encode(data),
        }
    }

    /// Decode send data from base64.
    #[must_use]
    pub fn decode_send(&self) -> Option<Vec<u8>> {
        if let Self::Send { data } = self {
            BASE64.decode(data).ok()
        } else {
            None
        }
    }
}

/// Message from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session snapshot.
    State {
        state: PortState,
        baud_rate: BaudRate,
        can_use_serial: bool,
    },
    /// Completed frame from the device.
    Message { value: String, timestamp: u64 },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Create an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl From<SerialMessage> for ServerMessage {
    fn from(msg: SerialMessage) -> Self {
        Self::Message {
            value: msg.value,
            timestamp: msg.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_roundtrip() {
        let msg = ClientMessage::send(b"G28\n");
        assert_eq!(msg.decode_send().unwrap(), b"G28\n");
        assert!(ClientMessage::Ping.decode_send().is_none());
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let msg = ClientMessage::Send {
            data: "not base64!".to_string(),
        };
        assert!(msg.decode_send().is_none());
    }

    #[test]
    fn test_client_message_parsing() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"set_baud_rate","baud_rate":9600}"#).unwrap();
        if let ClientMessage::SetBaudRate { baud_rate } = parsed {
            assert_eq!(baud_rate, BaudRate::B9600);
        } else {
            panic!("Wrong message type");
        }

        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"connect"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Connect));
    }

    #[test]
    fn test_unsupported_baud_rate_fails_to_parse() {
        let parsed =
            serde_json::from_str::<ClientMessage>(r#"{"type":"set_baud_rate","baud_rate":1200}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::State {
            state: PortState::Open,
            baud_rate: BaudRate::B115200,
            can_use_serial: true,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["state"], "open");
        assert_eq!(json["baud_rate"], 115_200);
        assert_eq!(json["can_use_serial"], true);

        let msg = ServerMessage::from(SerialMessage {
            value: "AB".to_string(),
            timestamp: 42,
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["value"], "AB");
        assert_eq!(json["timestamp"], 42);
    }
}
