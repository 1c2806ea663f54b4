//! Transport layer for browser clients.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - WebSocket bridge to a `ConnectionManager` (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::create_ws_router;

pub use protocol::{ClientMessage, ServerMessage};
