//! Native serial platform backed by the `serialport` crate.

use std::{
    io::{self, Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serial_link_core::{
    BaudRate, PortReader, SerialConfig, SerialPlatform, SerialPort, TransportError,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Chunks buffered between the blocking read thread and the read loop.
const READ_CHANNEL_DEPTH: usize = 64;
/// Size of one blocking read.
const READ_BUF_SIZE: usize = 1024;
/// Retry interval while the read channel is full.
const FULL_CHANNEL_BACKOFF: Duration = Duration::from_millis(5);

type SharedPort = Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>;

/// Blocking thread reading from a cloned device handle.
struct ReadThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Platform for operating-system serial ports.
///
/// Port selection picks the configured device, or the first enumerated
/// port when none is configured.
pub struct NativePlatform {
    config: SerialConfig,
    disconnect_tx: broadcast::Sender<String>,
}

impl NativePlatform {
    /// Create a platform from configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        let (disconnect_tx, _) = broadcast::channel(16);
        Self {
            config,
            disconnect_tx,
        }
    }

    /// Names of the ports currently present.
    ///
    /// # Errors
    /// Returns error if enumeration fails.
    pub async fn list_ports() -> Result<Vec<String>, TransportError> {
        tokio::task::spawn_blocking(available_port_names)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?
    }
}

fn available_port_names() -> Result<Vec<String>, TransportError> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| TransportError::Other(format!("Failed to enumerate ports: {e}")))
}

#[async_trait]
impl SerialPlatform for NativePlatform {
    fn is_available(&self) -> bool {
        true
    }

    async fn request_port(&self) -> Result<Box<dyn SerialPort>, TransportError> {
        let path = match &self.config.port_path {
            Some(path) => path.clone(),
            None => Self::list_ports()
                .await?
                .into_iter()
                .next()
                .ok_or(TransportError::NoPortSelected)?,
        };
        tracing::debug!(port = %path, "Port selected");

        Ok(Box::new(NativePort {
            path,
            config: self.config.clone(),
            port: Arc::new(Mutex::new(None)),
            reader_held: Arc::new(AtomicBool::new(false)),
            read_threads: Mutex::new(Vec::new()),
            watch: Mutex::new(None),
            disconnect_tx: self.disconnect_tx.clone(),
        }))
    }

    fn disconnect_events(&self) -> broadcast::Receiver<String> {
        self.disconnect_tx.subscribe()
    }
}

/// Operating-system serial port.
pub struct NativePort {
    path: String,
    config: SerialConfig,
    port: SharedPort,
    reader_held: Arc<AtomicBool>,
    read_threads: Mutex<Vec<ReadThread>>,
    watch: Mutex<Option<CancellationToken>>,
    disconnect_tx: broadcast::Sender<String>,
}

impl NativePort {
    /// Poll the port list and report when this port disappears.
    ///
    /// Devices that never show up in the enumeration (pseudo terminals,
    /// for instance) are not reported.
    fn spawn_presence_watch(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let path = self.path.clone();
        let tx = self.disconnect_tx.clone();
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut seen = false;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match tokio::task::spawn_blocking(available_port_names).await {
                    Ok(Ok(names)) => {
                        let present = names.iter().any(|n| n == &path);
                        if seen && !present {
                            tracing::debug!(port = %path, "Port no longer present");
                            let _ = tx.send(path);
                            break;
                        }
                        seen |= present;
                    }
                    Ok(Err(e)) => tracing::debug!("Presence check failed: {e}"),
                    Err(e) => tracing::debug!("Presence check task failed: {e}"),
                }
            }
        });

        cancel
    }

    fn take_read_threads(&self) -> Vec<ReadThread> {
        std::mem::take(
            &mut *self
                .read_threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Stop every read thread and wait until each has dropped its handle.
    ///
    /// A thread notices the stop flag after its current read returns, which
    /// takes at most the configured read timeout.
    async fn join_read_threads(&self) {
        let threads = self.take_read_threads();
        for thread in &threads {
            thread.stop.store(true, Ordering::SeqCst);
        }
        for thread in threads {
            if let Err(e) = thread.handle.await {
                tracing::debug!(port = %self.path, "Read thread failed: {e}");
            }
        }
    }

    fn stop_watch(&self) {
        if let Some(token) = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

#[async_trait]
impl SerialPort for NativePort {
    fn name(&self) -> String {
        self.path.clone()
    }

    async fn open(&mut self, baud_rate: BaudRate) -> Result<(), TransportError> {
        let path = self.path.clone();
        let timeout = Duration::from_millis(self.config.read_timeout_ms);

        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate.as_u32())
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(timeout)
                .open()
        })
        .await
        .map_err(|e| TransportError::Other(e.to_string()))?;

        let port = opened.map_err(|e| {
            tracing::warn!(port = %self.path, "Failed to open serial port: {e}");
            TransportError::PortBusy(format!("{}: {e}", self.path))
        })?;

        *self.port.lock().unwrap_or_else(PoisonError::into_inner) = Some(port);
        *self.watch.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(self.spawn_presence_watch());
        Ok(())
    }

    fn reader(&self) -> Result<Box<dyn PortReader>, TransportError> {
        let mut clone = self
            .port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .ok_or(TransportError::NotOpen)?
            .try_clone()
            .map_err(io::Error::from)?;

        if self.reader_held.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ReaderLocked);
        }

        let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            while !thread_stop.load(Ordering::SeqCst) {
                match clone.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if !forward(&tx, &thread_stop, Ok(buf[..n].to_vec())) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        forward(&tx, &thread_stop, Err(e));
                        break;
                    }
                }
            }
            // `clone` drops here, releasing the duplicated descriptor.
        });

        let mut threads = self
            .read_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        threads.retain(|t| !t.handle.is_finished());
        threads.push(ReadThread {
            stop: Arc::clone(&stop),
            handle,
        });
        drop(threads);

        Ok(Box::new(NativeReader {
            rx,
            stop,
            held: Arc::clone(&self.reader_held),
        }))
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let port = Arc::clone(&self.port);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut guard = port.lock().unwrap_or_else(PoisonError::into_inner);
            let port = guard.as_mut().ok_or(TransportError::NotOpen)?;
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Other(e.to_string()))?
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.stop_watch();
        self.join_read_threads().await;
        let port = self
            .port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::NotOpen)?;
        // Dropping the handle closes the device.
        drop(port);
        Ok(())
    }
}

impl Drop for NativePort {
    fn drop(&mut self) {
        self.stop_watch();
        for thread in self.take_read_threads() {
            thread.stop.store(true, Ordering::SeqCst);
        }
    }
}

/// Hand one read result to the reader, waiting while the channel is full.
///
/// Returns false once the reader is gone or the thread was told to stop.
fn forward(
    tx: &mpsc::Sender<io::Result<Vec<u8>>>,
    stop: &AtomicBool,
    mut item: io::Result<Vec<u8>>,
) -> bool {
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(back)) => {
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                item = back;
                std::thread::sleep(FULL_CHANNEL_BACKOFF);
            }
        }
    }
}

/// Read half fed by a blocking read thread.
struct NativeReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    held: Arc<AtomicBool>,
}

#[async_trait]
impl PortReader for NativeReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }
}

impl Drop for NativeReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.held.store(false, Ordering::SeqCst);
    }
}
