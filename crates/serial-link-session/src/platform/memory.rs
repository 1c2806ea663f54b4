//! In-memory serial platform.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serial_link_core::{BaudRate, PortReader, SerialPlatform, SerialPort, TransportError};
use tokio::sync::{broadcast, mpsc, watch};

/// Item fed into the device's receive side.
enum Feed {
    Data(Vec<u8>),
    Error(String),
    End,
}

#[derive(Default)]
struct DeviceState {
    open: bool,
    removed: bool,
    fail_open: bool,
    fail_writes: bool,
    opened_with: Option<BaudRate>,
    open_count: usize,
    close_count: usize,
    writes: Vec<Vec<u8>>,
}

/// One simulated device shared by the platform, its ports and handles.
struct Device {
    name: String,
    state: Mutex<DeviceState>,
    feed_tx: mpsc::UnboundedSender<Feed>,
    feed_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Feed>>>>,
    writes_tx: watch::Sender<usize>,
    disconnect_tx: broadcast::Sender<String>,
}

impl Device {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discard everything queued for the read side, so the next session
    /// starts on a fresh stream.
    fn drain_feed(&self) {
        if let Some(rx) = self
            .feed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            while rx.try_recv().is_ok() {}
        }
    }
}

/// In-memory platform exposing a single scripted device.
///
/// Useful for tests and for running without hardware. Bytes pushed through
/// a [`MemoryPortHandle`] show up on the port's read side; everything the
/// session writes is recorded.
pub struct MemoryPlatform {
    device: Arc<Device>,
    available: AtomicBool,
    fail_selection: AtomicBool,
}

impl MemoryPlatform {
    /// Create a platform with one device called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (writes_tx, _) = watch::channel(0);
        let (disconnect_tx, _) = broadcast::channel(16);

        Self {
            device: Arc::new(Device {
                name: name.into(),
                state: Mutex::new(DeviceState::default()),
                feed_tx,
                feed_rx: Arc::new(Mutex::new(Some(feed_rx))),
                writes_tx,
                disconnect_tx,
            }),
            available: AtomicBool::new(true),
            fail_selection: AtomicBool::new(false),
        }
    }

    /// Handle for driving and inspecting the device.
    #[must_use]
    pub fn handle(&self) -> MemoryPortHandle {
        MemoryPortHandle {
            device: Arc::clone(&self.device),
        }
    }

    /// Toggle whether the platform reports a serial transport.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make port selection fail, as if the chooser was cancelled.
    pub fn set_fail_selection(&self, fail: bool) {
        self.fail_selection.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SerialPlatform for MemoryPlatform {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn request_port(&self) -> Result<Box<dyn SerialPort>, TransportError> {
        if self.fail_selection.load(Ordering::SeqCst) || self.device.state().removed {
            return Err(TransportError::NoPortSelected);
        }
        Ok(Box::new(MemoryPort {
            device: Arc::clone(&self.device),
        }))
    }

    fn disconnect_events(&self) -> broadcast::Receiver<String> {
        self.device.disconnect_tx.subscribe()
    }
}

/// Port bound to the in-memory device.
pub struct MemoryPort {
    device: Arc<Device>,
}

#[async_trait]
impl SerialPort for MemoryPort {
    fn name(&self) -> String {
        self.device.name.clone()
    }

    async fn open(&mut self, baud_rate: BaudRate) -> Result<(), TransportError> {
        let mut state = self.device.state();
        if state.removed {
            return Err(TransportError::Disconnected);
        }
        if state.fail_open || state.open {
            return Err(TransportError::PortBusy(self.device.name.clone()));
        }
        state.open = true;
        state.opened_with = Some(baud_rate);
        state.open_count += 1;
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn PortReader>, TransportError> {
        if !self.device.state().open {
            return Err(TransportError::NotOpen);
        }
        let rx = self
            .device
            .feed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::ReaderLocked)?;

        Ok(Box::new(MemoryReader {
            rx: Some(rx),
            slot: Arc::clone(&self.device.feed_rx),
        }))
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let count = {
            let mut state = self.device.state();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if state.removed {
                return Err(TransportError::Disconnected);
            }
            if state.fail_writes {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "write rejected",
                )));
            }
            state.writes.push(data.to_vec());
            state.writes.len()
        };
        self.device.writes_tx.send_replace(count);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.device.state();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            state.open = false;
            state.close_count += 1;
        }
        self.device.drain_feed();
        Ok(())
    }
}

/// Exclusive read half; hands the receiver back when dropped.
struct MemoryReader {
    rx: Option<mpsc::UnboundedReceiver<Feed>>,
    slot: Arc<Mutex<Option<mpsc::UnboundedReceiver<Feed>>>>,
}

#[async_trait]
impl PortReader for MemoryReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Feed::Data(bytes)) => Ok(Some(bytes)),
            Some(Feed::Error(message)) => Err(TransportError::Other(message)),
            Some(Feed::End) | None => Ok(None),
        }
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        }
    }
}

/// Test and demo handle for the in-memory device.
#[derive(Clone)]
pub struct MemoryPortHandle {
    device: Arc<Device>,
}

impl MemoryPortHandle {
    /// Queue bytes for the read side.
    pub fn push(&self, bytes: impl AsRef<[u8]>) {
        let _ = self.device.feed_tx.send(Feed::Data(bytes.as_ref().to_vec()));
    }

    /// Queue a transport error for the read side.
    pub fn push_error(&self, message: impl Into<String>) {
        let _ = self.device.feed_tx.send(Feed::Error(message.into()));
    }

    /// Queue end-of-stream for the read side.
    pub fn end_stream(&self) {
        let _ = self.device.feed_tx.send(Feed::End);
    }

    /// Simulate the device being unplugged.
    pub fn unplug(&self) {
        self.device.state().removed = true;
        let _ = self.device.disconnect_tx.send(self.device.name.clone());
    }

    /// Simulate the device being plugged back in.
    pub fn replug(&self) {
        self.device.state().removed = false;
    }

    /// Make the next opens fail as if the port were busy.
    pub fn set_fail_open(&self, fail: bool) {
        self.device.state().fail_open = fail;
    }

    /// Make writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.device.state().fail_writes = fail;
    }

    /// Whether the port is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.device.state().open
    }

    /// Whether a reader currently holds the read side.
    #[must_use]
    pub fn reader_locked(&self) -> bool {
        self.device
            .feed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Baud rate of the most recent open.
    #[must_use]
    pub fn opened_with(&self) -> Option<BaudRate> {
        self.device.state().opened_with
    }

    /// Number of successful opens.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.device.state().open_count
    }

    /// Number of closes.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.device.state().close_count
    }

    /// Every write so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.device.state().writes.clone()
    }

    /// Wait until at least `count` writes have been recorded.
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.device.writes_tx.subscribe();
        let _ = rx.wait_for(|written| *written >= count).await;
    }
}
