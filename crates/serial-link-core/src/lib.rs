//! Core abstractions for serial-link sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `PortState`, `BaudRate`, `SerialMessage` - Session data model
//! - `SerialConfig` - Session configuration
//! - `FrameReader` - `<...>` framing of decoded text
//! - `TextDecoder` - Streaming UTF-8 decoding of raw chunks
//! - `SubscriberRegistry` - Message fan-out to callbacks and streams
//! - Platform traits for port selection and I/O

pub mod config;
pub mod decoder;
pub mod framing;
pub mod subscribers;
pub mod traits;
pub mod types;

pub use config::{ConfigError, SerialConfig};
pub use decoder::TextDecoder;
pub use framing::{ACK_BYTE, FRAME_END, FRAME_START, FrameReader};
pub use subscribers::{MessageCallback, SubscriberRegistry, Unsubscribe};
pub use traits::{PortReader, SerialPlatform, SerialPort, TransportError};
pub use types::{BaudRate, PortState, SerialMessage};
