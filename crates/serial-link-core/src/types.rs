//! Session state, baud rates and decoded messages.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Lifecycle state of the serial session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    /// No port is held.
    #[default]
    Closed,
    /// A port is being selected or opened.
    Opening,
    /// The port is open and the read loop is attached.
    Open,
    /// Teardown is in progress.
    Closing,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Supported line speeds.
///
/// Serializes as the bare integer (`115200`), so configuration files and
/// the wire protocol never see the variant names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    /// 9600 baud, low-rate link.
    B9600,
    /// 19200 baud.
    B19200,
    /// 38400 baud.
    B38400,
    /// 57600 baud.
    B57600,
    /// 115200 baud, high-rate link.
    #[default]
    B115200,
}

impl BaudRate {
    /// Every supported rate, slowest first.
    pub const ALL: [Self; 5] = [
        Self::B9600,
        Self::B19200,
        Self::B38400,
        Self::B57600,
        Self::B115200,
    ];

    /// Bits per second.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B19200 => 19_200,
            Self::B38400 => 38_400,
            Self::B57600 => 57_600,
            Self::B115200 => 115_200,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|rate| rate.as_u32() == value)
            .ok_or(ConfigError::InvalidBaudRate(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.as_u32()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// A completed frame, as handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialMessage {
    /// Text between the start and end delimiters, delimiters excluded.
    pub value: String,
    /// Capture time at frame completion (Unix epoch milliseconds).
    pub timestamp: u64,
}

impl SerialMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn now(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_serializes_as_integer() {
        let json = serde_json::to_string(&BaudRate::B9600).unwrap();
        assert_eq!(json, "9600");

        let parsed: BaudRate = serde_json::from_str("115200").unwrap();
        assert_eq!(parsed, BaudRate::B115200);
    }

    #[test]
    fn test_unknown_baud_rate_rejected() {
        assert!(serde_json::from_str::<BaudRate>("1234").is_err());
        assert!(matches!(
            BaudRate::try_from(300),
            Err(ConfigError::InvalidBaudRate(300))
        ));
    }

    #[test]
    fn test_port_state_wire_names() {
        assert_eq!(serde_json::to_string(&PortState::Closing).unwrap(), "\"closing\"");
        assert_eq!(PortState::default(), PortState::Closed);
        assert_eq!(PortState::Opening.to_string(), "opening");
    }

    #[test]
    fn test_message_timestamp_is_recent() {
        let before = now_millis();
        let msg = SerialMessage::now("AB");
        assert_eq!(msg.value, "AB");
        assert!(msg.timestamp >= before);
    }
}
