//! Serial session orchestration.
//!
//! Provides:
//! - `ConnectionManager` - Single-port session lifecycle and send path
//! - The framed read loop feeding subscribers and acknowledgments
//! - Platform implementations (in-memory, native)

pub mod manager;
pub mod platform;
pub mod reader;

pub use manager::{ConnectionManager, ManagerError};
