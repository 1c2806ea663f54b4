//! Platform traits for port selection, I/O and removal events.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::BaudRate;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Serial transport is not available on this platform")]
    Unavailable,
    #[error("No port selected")]
    NoPortSelected,
    #[error("Port busy or unavailable: {0}")]
    PortBusy(String),
    #[error("Port is not open")]
    NotOpen,
    #[error("Port already has an active reader")]
    ReaderLocked,
    #[error("Device disconnected")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Other(String),
}

/// Host platform providing serial ports.
#[async_trait]
pub trait SerialPlatform: Send + Sync + 'static {
    /// Whether the serial transport can be used at all.
    fn is_available(&self) -> bool;

    /// Select a port.
    ///
    /// This is the port chooser: it fails with [`TransportError::NoPortSelected`]
    /// when the selection is cancelled or nothing is available.
    async fn request_port(&self) -> Result<Box<dyn SerialPort>, TransportError>;

    /// Receiver for hardware removal notifications.
    ///
    /// Each event carries the name of the port that went away.
    fn disconnect_events(&self) -> broadcast::Receiver<String>;
}

/// A selected serial port.
#[async_trait]
pub trait SerialPort: Send + Sync {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3").
    fn name(&self) -> String;

    /// Open the port at the given rate.
    async fn open(&mut self, baud_rate: BaudRate) -> Result<(), TransportError>;

    /// Acquire the read half.
    ///
    /// Only one reader may be held at a time; the lock is released when the
    /// returned reader is dropped.
    fn reader(&self) -> Result<Box<dyn PortReader>, TransportError>;

    /// Write the whole buffer.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the port.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Exclusive read half of an open port.
#[async_trait]
pub trait PortReader: Send {
    /// Read the next chunk of raw bytes.
    ///
    /// Returns `Ok(None)` once the stream has ended.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}
