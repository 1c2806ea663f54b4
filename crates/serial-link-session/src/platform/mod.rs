//! Platform implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "memory")]
pub use memory::{MemoryPlatform, MemoryPortHandle};

#[cfg(feature = "native")]
pub use native::NativePlatform;
